use serde::{Deserialize, Serialize};

/// プロダクト（Bugzilla の product 要素）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
}

impl Project {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    /// 所属プロダクト名（同じレコード内で判明しなかった場合は None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl Component {
    pub fn new(name: &str, project: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            project: project.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub name: String,
}

impl Classification {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}
