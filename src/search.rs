use regex::Regex;
use reqwest::{Method, StatusCode};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, error, info, warn};

use crate::client::Session;
use crate::iterator::IssueIterator;
use crate::models::SearchParams;

/// 検索結果ページのエンドポイント
pub const SEARCH_PATH: &str = "buglist.cgi";

static ISSUE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="show_bug\.cgi\?id=(\d+)""#).unwrap());

/// 検索結果HTMLからIssue IDを出現順に取り出す（重複は最初の位置のみ残す）
pub fn extract_issue_ids(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for line in body.lines() {
        for caps in ISSUE_LINK.captures_iter(line) {
            if let Some(id) = caps.get(1) {
                if seen.insert(id.as_str()) {
                    ids.push(id.as_str().to_string());
                }
            }
        }
    }
    ids
}

impl Session {
    /// 検索を実行し、該当するIssue IDを返す
    ///
    /// 通信エラーや200以外の応答は `None`。結果が0件の場合は空の `Vec`。
    pub async fn search(&mut self, params: &SearchParams) -> Option<Vec<String>> {
        if self.is_closed() {
            warn!("Search on a closed session; returning nothing");
            return None;
        }

        let url = match self.endpoint(SEARCH_PATH) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Cannot build search URL");
                return None;
            }
        };
        let query = self.config.search_defaults.merge(params);
        debug!(params = query.len(), "Searching");

        let response = match self.request(Method::GET, url).query(&query).send().await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Search request failed");
                return None;
            }
        };
        self.cookies.capture(response.headers());

        let status = response.status();
        if status != StatusCode::OK {
            warn!(status = status.as_u16(), "Search returned a non-OK status");
            return None;
        }

        match response.text().await {
            Ok(body) => {
                let ids = extract_issue_ids(&body);
                info!(found = ids.len(), "Search completed");
                Some(ids)
            }
            Err(e) => {
                error!(error = %e, "Failed to read search results");
                None
            }
        }
    }

    /// 検索してヒット件数を通知し、該当Issueを一括取得するイテレーターを返す
    ///
    /// `on_count` は取得開始前に一度だけ呼ばれる。検索に失敗した場合は呼ばれない。
    pub async fn search_with_count<F>(&mut self, params: &SearchParams, on_count: F) -> IssueIterator
    where
        F: FnOnce(usize),
    {
        match self.search(params).await {
            Some(ids) => {
                on_count(ids.len());
                self.fetch(ids)
            }
            None => IssueIterator::empty(),
        }
    }

    /// 検索に該当するIssueを一括取得するイテレーターを返す
    pub async fn search_issues(&mut self, params: &SearchParams) -> IssueIterator {
        self.search_with_count(params, |_| {}).await
    }
}
