//! XMLエクスポートのストリーミングデコーダー
//!
//! レスポンス本文をイベント単位で読み進め、`<bug>` 要素が閉じるたびに
//! 完成したIssueを送信キューへ渡す。文書全体をメモリに展開しない。

mod fields;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::memo::MetadataCache;
use crate::models::{Attachment, Comment, Issue};
use fields::{IssueFrame, LeafField, parse_bool, set_attachment_field, set_comment_field};

const WRAPPER: &[u8] = b"bugzilla";
const RECORD: &[u8] = b"bug";
const COMMENT: &[u8] = b"long_desc";
const ATTACHMENT: &[u8] = b"attachment";

/// 現在組み立て中の対象
#[derive(Debug)]
enum Frame {
    Issue(IssueFrame),
    Comment(Comment),
    Attachment(Attachment),
}

/// デコードの終了理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// 文書の終端まで読み切った
    Completed,
    /// 受信側が破棄された
    ConsumerGone,
    /// 不正な文字データ（サーバー側のデータ品質の問題）
    MalformedCharacter(String),
    /// XMLとして不正な文書
    MalformedDocument(String),
    /// 本文の読み込み中の通信エラー
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeSummary {
    /// キューへ渡したIssue数
    pub emitted: usize,
    pub termination: Termination,
}

enum Stop {
    ConsumerGone,
    BadText(String),
    Xml(quick_xml::Error),
}

impl From<quick_xml::Error> for Stop {
    fn from(e: quick_xml::Error) -> Self {
        Stop::Xml(e)
    }
}

impl From<quick_xml::events::attributes::AttrError> for Stop {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        Stop::Xml(e.into())
    }
}

/// `<bugzilla>` 文書を `Issue` の列に変換するデコーダー
///
/// メタデータのキャッシュはデコーダーごとに持つため、同じ文書を別のデコーダーで
/// 読むと値は等しいが別インスタンスのメタデータになる。
#[derive(Debug, Default)]
pub struct IssueDecoder {
    cache: MetadataCache,
    base_uri: Option<String>,
    server_version: Option<String>,
    stack: Vec<Frame>,
    leaf: Option<LeafField>,
    emitted: usize,
}

impl IssueDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 文書を最後まで（または中断されるまで）読み、完成したIssueを順に `sink` へ送る
    ///
    /// `sink` が満杯の間は送信で待機する。単一フィールドの変換失敗は記録して読み飛ばし、
    /// 文書自体の破損はその時点で終了する（送信済みのIssueはそのまま有効）。
    pub async fn decode<R>(mut self, source: R, sink: mpsc::Sender<Issue>) -> DecodeSummary
    where
        R: AsyncBufRead + Unpin,
    {
        let mut reader = Reader::from_reader(source);
        let mut buf = Vec::new();

        let termination = loop {
            let step = match reader.read_event_into_async(&mut buf).await {
                Ok(Event::Eof) => break Termination::Completed,
                Ok(event) => self.handle(event, &sink).await,
                Err(e) => Err(Stop::Xml(e)),
            };

            if let Err(stop) = step {
                break self.classify(stop, reader.buffer_position() as u64);
            }
            buf.clear();
        };

        if termination == Termination::Completed && !self.stack.is_empty() {
            warn!(
                open_frames = self.stack.len(),
                "Export ended inside an unfinished record; discarding it"
            );
        }

        debug!(emitted = self.emitted, termination = ?termination, "Decoding finished");
        DecodeSummary {
            emitted: self.emitted,
            termination,
        }
    }

    async fn handle(&mut self, event: Event<'_>, sink: &mpsc::Sender<Issue>) -> Result<(), Stop> {
        match event {
            Event::Start(start) => self.on_start(&start)?,
            Event::Empty(start) => {
                self.on_start(&start)?;
                self.on_end(start.name().as_ref(), sink).await?;
            }
            Event::End(end) => self.on_end(end.name().as_ref(), sink).await?,
            Event::Text(text) => {
                if let Some(leaf) = self.leaf.as_mut() {
                    leaf.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(leaf) = self.leaf.as_mut() {
                    let bytes = data.into_inner();
                    let text = std::str::from_utf8(&bytes)
                        .map_err(|e| Stop::BadText(e.to_string()))?;
                    leaf.text.push_str(text);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_start(&mut self, start: &BytesStart<'_>) -> Result<(), Stop> {
        let name = start.name();
        let mut attrs = attributes(start)?;

        match name.as_ref() {
            WRAPPER if self.stack.is_empty() => {
                self.base_uri = attrs.remove("urlbase");
                self.server_version = attrs.remove("version");
                info!(
                    base_uri = ?self.base_uri,
                    server_version = ?self.server_version,
                    "Reading issue export"
                );
            }
            RECORD => {
                let mut frame = IssueFrame::default();
                frame.issue.base_uri = self.base_uri.clone();
                frame.issue.server_version = self.server_version.clone();
                frame.issue.error = attrs.remove("error");
                self.stack.push(Frame::Issue(frame));
            }
            COMMENT if self.in_issue() => {
                self.stack.push(Frame::Comment(Comment {
                    is_private: flag(&attrs, "isprivate"),
                    ..Default::default()
                }));
            }
            ATTACHMENT if self.in_issue() => {
                self.stack.push(Frame::Attachment(Attachment {
                    is_obsolete: flag(&attrs, "isobsolete"),
                    is_patch: flag(&attrs, "ispatch"),
                    is_private: flag(&attrs, "isprivate"),
                    ..Default::default()
                }));
            }
            _ if !self.stack.is_empty() => {
                if let Some(open) = &self.leaf {
                    debug!(outer = %open.name, "Nested element inside a field; keeping the innermost");
                }
                let element = String::from_utf8_lossy(name.as_ref()).into_owned();
                self.leaf = Some(LeafField::new(element, attrs.remove("name")));
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_end(&mut self, name: &[u8], sink: &mpsc::Sender<Issue>) -> Result<(), Stop> {
        match name {
            RECORD if self.in_issue() => self.finish_issue(sink).await,
            COMMENT if matches!(self.stack.last(), Some(Frame::Comment(_))) => {
                self.finish_child();
                Ok(())
            }
            ATTACHMENT if matches!(self.stack.last(), Some(Frame::Attachment(_))) => {
                self.finish_child();
                Ok(())
            }
            _ => {
                if let Some(leaf) = self.leaf.take_if(|leaf| leaf.name.as_bytes() == name) {
                    self.assign(leaf);
                }
                Ok(())
            }
        }
    }

    fn in_issue(&self) -> bool {
        matches!(self.stack.last(), Some(Frame::Issue(_)))
    }

    /// 葉要素の値を、最も内側の組み立て対象に設定する
    fn assign(&mut self, leaf: LeafField) {
        let owner = self.current_issue_id();
        match self.stack.last_mut() {
            Some(Frame::Issue(frame)) => frame.set_field(leaf, &mut self.cache),
            Some(Frame::Comment(comment)) => set_comment_field(comment, &owner, leaf),
            Some(Frame::Attachment(attachment)) => set_attachment_field(attachment, &owner, leaf),
            None => {}
        }
    }

    fn current_issue_id(&self) -> String {
        self.stack
            .iter()
            .rev()
            .find_map(|frame| match frame {
                Frame::Issue(frame) => Some(frame.issue.id.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn finish_child(&mut self) {
        let child = self.stack.pop();
        let Some(Frame::Issue(parent)) = self.stack.last_mut() else {
            warn!("Comment or attachment closed outside of a record; dropping it");
            return;
        };

        match child {
            Some(Frame::Comment(comment)) => parent.issue.comments.push(comment),
            Some(Frame::Attachment(mut attachment)) => {
                attachment.url = match (&self.base_uri, &attachment.id) {
                    (Some(base), Some(id)) => Some(attachment_url(base, id)),
                    _ => None,
                };
                parent.issue.attachments.push(attachment);
            }
            _ => {}
        }
    }

    async fn finish_issue(&mut self, sink: &mpsc::Sender<Issue>) -> Result<(), Stop> {
        let Some(Frame::Issue(frame)) = self.stack.pop() else {
            return Ok(());
        };

        let issue = frame.finish(&mut self.cache);
        if let Some(reason) = &issue.error {
            warn!(issue = %issue.id, reason = %reason, "Server reported an error for this record");
        }

        debug!(issue = %issue.id, "Issue decoded");
        sink.send(issue).await.map_err(|_| Stop::ConsumerGone)?;
        self.emitted += 1;
        Ok(())
    }

    fn classify(&self, stop: Stop, position: u64) -> Termination {
        let e = match stop {
            Stop::ConsumerGone => {
                debug!(emitted = self.emitted, "Issue consumer went away; stopping decode");
                return Termination::ConsumerGone;
            }
            Stop::BadText(reason) => {
                error!(
                    emitted = self.emitted,
                    position,
                    error = %reason,
                    "Server sent malformed character data (data quality problem, not a client bug); ending batch"
                );
                return Termination::MalformedCharacter(reason);
            }
            Stop::Xml(e) => e,
        };

        match e {
            quick_xml::Error::Io(io) => {
                error!(emitted = self.emitted, position, error = %io, "Export stream failed while reading");
                Termination::Transport(io.to_string())
            }
            quick_xml::Error::Encoding(_) | quick_xml::Error::Escape(_) => {
                error!(
                    emitted = self.emitted,
                    position,
                    error = %e,
                    "Server sent malformed character data (data quality problem, not a client bug); ending batch"
                );
                Termination::MalformedCharacter(e.to_string())
            }
            other => {
                error!(emitted = self.emitted, position, error = %other, "Malformed export document; ending batch");
                Termination::MalformedDocument(other.to_string())
            }
        }
    }
}

fn attributes(start: &BytesStart<'_>) -> Result<HashMap<String, String>, Stop> {
    let mut attrs = HashMap::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn flag(attrs: &HashMap<String, String>, name: &str) -> bool {
    attrs.get(name).is_some_and(|value| parse_bool(value))
}

fn attachment_url(base: &str, id: &str) -> String {
    let separator = if base.ends_with('/') { "" } else { "/" };
    format!("{}{}attachment.cgi?id={}", base, separator, id)
}
