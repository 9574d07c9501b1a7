use serde::{Deserialize, Serialize};

/// 未解決として扱うステータス名
const OPEN_STATUSES: &[&str] = &[
    "UNCONFIRMED",
    "CONFIRMED",
    "NEW",
    "ASSIGNED",
    "REOPENED",
    "IN_PROGRESS",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    #[serde(rename = "isOpen")]
    pub is_open: bool,
}

impl Status {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_open: OPEN_STATUSES.contains(&name.to_ascii_uppercase().as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub name: String,
}

impl Resolution {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.name.eq_ignore_ascii_case("DUPLICATE")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_open_detection() {
        assert!(Status::new("NEW").is_open);
        assert!(Status::new("reopened").is_open);
        assert!(!Status::new("RESOLVED").is_open);
        assert!(!Status::new("VERIFIED").is_open);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(Status::new("ASSIGNED")).unwrap();

        assert_eq!(json["name"], "ASSIGNED");
        assert_eq!(json["isOpen"], true);
    }

    #[test]
    fn test_resolution_duplicate() {
        assert!(Resolution::new("DUPLICATE").is_duplicate());
        assert!(!Resolution::new("FIXED").is_duplicate());
    }
}
