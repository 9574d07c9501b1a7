use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueType {
    pub name: String,
}

impl IssueType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}
