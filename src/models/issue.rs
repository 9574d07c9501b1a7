use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::{
    Classification, Component, IssueType, Priority, Project, Resolution, Severity, Status, User,
};

/// XMLエクスポートから復元された1件のバグ
///
/// メタデータ（ステータス、優先度など）はデコーダー内で共有された `Arc` を保持する。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(rename = "baseUri")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_uri: Option<String>,
    #[serde(rename = "serverVersion")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    /// 取得エラー（NotFound, NotPermitted など）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Arc<Status>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Arc<Resolution>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Arc<Priority>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Arc<Severity>>,
    #[serde(rename = "issueType")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<Arc<IssueType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Arc<Classification>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<Arc<Project>>,
    pub components: Vec<Arc<Component>>,
    #[serde(rename = "affectedVersions")]
    pub affected_versions: Vec<String>,
    #[serde(rename = "fixVersions")]
    pub fix_versions: Vec<String>,
    #[serde(rename = "plannedVersions")]
    pub planned_versions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporter: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<User>,
    pub cc: Vec<String>,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes: Option<i64>,
    #[serde(rename = "estimatedTime")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    pub comments: Vec<Comment>,
    pub attachments: Vec<Attachment>,
    pub links: Vec<IssueLink>,

    // 未知の要素は要素名をキーとしてそのまま保持
    #[serde(rename = "customFields")]
    pub custom_fields: HashMap<String, Vec<String>>,
}

impl Issue {
    /// ブラウザで開くためのURL（urlbase が分かる場合のみ）
    pub fn url(&self) -> Option<String> {
        let base = self.base_uri.as_deref()?;
        let separator = if base.ends_with('/') { "" } else { "/" };
        Some(format!("{}{}show_bug.cgi?id={}", base, separator, self.id))
    }

    /// カスタムフィールドの最初の値
    pub fn custom_field(&self, name: &str) -> Option<&str> {
        self.custom_fields
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn links_of(&self, kind: LinkKind) -> impl Iterator<Item = &str> {
        self.links
            .iter()
            .filter(move |link| link.kind == kind)
            .map(|link| link.target.as_str())
    }

    /// コメントが参照する添付ファイルを、このIssue自身の添付一覧から解決する
    pub fn comment_attachments<'a>(&'a self, comment: &'a Comment) -> Vec<&'a Attachment> {
        comment
            .attachment_ids
            .iter()
            .filter_map(|id| self.attachments.iter().find(|a| a.id.as_deref() == Some(id)))
            .collect()
    }

    pub fn is_open(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.is_open)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    pub text: String,
    #[serde(rename = "isPrivate")]
    pub is_private: bool,
    /// 参照している添付ファイルID（内容は取得しない）
    #[serde(rename = "attachmentIds")]
    pub attachment_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attacher: Option<User>,
    #[serde(rename = "isObsolete")]
    pub is_obsolete: bool,
    #[serde(rename = "isPatch")]
    pub is_patch: bool,
    #[serde(rename = "isPrivate")]
    pub is_private: bool,
    /// 内容取得用のURL（Session::attachment_content で取得する）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    DependsOn,
    Blocks,
    DuplicateOf,
    SeeAlso,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLink {
    pub kind: LinkKind,
    pub target: String,
}

impl IssueLink {
    pub fn new(kind: LinkKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}
