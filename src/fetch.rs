use futures::TryStreamExt;
use reqwest::header::{COOKIE, HeaderValue};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};
use url::Url;

use crate::client::Session;
use crate::decoder::{DecodeSummary, IssueDecoder, Termination};
use crate::iterator::IssueIterator;
use crate::models::Issue;

/// 一括エクスポートのエンドポイント
pub const EXPORT_PATH: &str = "show_bug.cgi";

/// 指定したIDのIssueをXMLエクスポートで一括取得する生産側
///
/// セッションのクッキーは作成時点の写しを使い、セッション自体には触れない。
#[derive(Debug, Clone)]
pub struct BulkFetch {
    client: Client,
    url: Url,
    cookie: Option<HeaderValue>,
    ids: Vec<String>,
}

impl BulkFetch {
    pub(crate) fn new(client: Client, url: Url, cookie: Option<HeaderValue>, ids: Vec<String>) -> Self {
        Self {
            client,
            url,
            cookie,
            ids,
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// POST するフォーム本文（IDは要求順）
    pub fn form(&self) -> Vec<(&str, &str)> {
        let mut form: Vec<(&str, &str)> = self.ids.iter().map(|id| ("id", id.as_str())).collect();
        form.extend([
            ("ctype", "xml"),
            ("excludefield", "attachmentdata"),
            ("submit", "XML"),
        ]);
        form
    }

    /// リクエストを送り、レスポンス本文をデコードしながら `sink` へ送る
    ///
    /// 通信エラーや200以外の応答は記録のみ行い、何も送らずに終了する。
    pub async fn run(self, sink: mpsc::Sender<Issue>) -> Option<DecodeSummary> {
        let mut request = self.client.post(self.url.clone()).form(&self.form());
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!(url = %self.url, requested = self.ids.len(), error = %e, "Bulk export request failed");
                return None;
            }
        };

        if response.status() != StatusCode::OK {
            warn!(
                url = %self.url,
                status = response.status().as_u16(),
                "Bulk export returned a non-OK status"
            );
            return None;
        }

        info!(requested = self.ids.len(), "Streaming bulk export");
        let body = response.bytes_stream().map_err(std::io::Error::other);
        let summary = IssueDecoder::new()
            .decode(StreamReader::new(Box::pin(body)), sink)
            .await;

        if summary.termination == Termination::Completed && summary.emitted != self.ids.len() {
            warn!(
                requested = self.ids.len(),
                emitted = summary.emitted,
                "Export record count differs from the requested ids"
            );
        }
        Some(summary)
    }
}

impl Session {
    /// 指定したIDを要求順に一括取得するイテレーターを返す
    ///
    /// リクエストは最初の `next()` まで送られない。
    pub fn fetch<I, S>(&self, ids: I) -> IssueIterator
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return IssueIterator::empty();
        }
        if self.is_closed() {
            warn!(requested = ids.len(), "Fetch on a closed session; returning nothing");
            return IssueIterator::empty();
        }

        let url = match self.endpoint(EXPORT_PATH) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Cannot build export URL");
                return IssueIterator::empty();
            }
        };

        let fetch = BulkFetch::new(
            self.client.clone(),
            url,
            self.cookies.header_value(),
            ids,
        );
        IssueIterator::new(fetch.ids.len(), move |sink| async move {
            fetch.run(sink).await;
        })
    }
}
