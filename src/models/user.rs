use serde::{Deserialize, Serialize};

/// 報告者・担当者・コメント投稿者
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(rename = "displayName")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl User {
    pub fn new(login: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            login: login.into(),
            display_name: display_name.filter(|name| !name.trim().is_empty()),
        }
    }
}
