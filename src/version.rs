use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::{Error, Result};

/// サポートする最小サーバーバージョン
pub const DEFAULT_MIN_VERSION: &str = "3.0";

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"version\s+([\d.]+)")
        .case_insensitive(true)
        .build()
        .unwrap()
});

/// ドット区切りのサーバーバージョン（例: "4.4.12"）
///
/// 比較は数値の要素ごとに行い、足りない要素は 0 とみなす（"4.4" == "4.4.0"）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerVersion {
    raw: String,
    parts: Vec<u32>,
}

impl ServerVersion {
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// HTMLページ本文を1行ずつ走査し、最初に見つかったバージョン表記を返す
    pub fn scan(body: &str) -> Option<ServerVersion> {
        body.lines()
            .filter_map(|line| VERSION_PATTERN.captures(line))
            .find_map(|caps| caps.get(1)?.as_str().parse().ok())
    }
}

impl FromStr for ServerVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim().trim_end_matches('.');
        let parts = raw
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidConfiguration(format!("Invalid version: {}", s)))?;

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }
}

impl TryFrom<String> for ServerVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ServerVersion> for String {
    fn from(version: ServerVersion) -> Self {
        version.raw
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| {
                let a = self.parts.get(i).copied().unwrap_or(0);
                let b = other.parts.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ServerVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ServerVersion {}

/// サポート対象バージョンの範囲（どちらの境界も省略可能 = 無制限）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: Option<ServerVersion>,
    pub max: Option<ServerVersion>,
}

impl VersionRange {
    pub fn new(min: Option<ServerVersion>, max: Option<ServerVersion>) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: &ServerVersion) -> bool {
        let above_min = self.min.as_ref().is_none_or(|min| version >= min);
        let below_max = self.max.as_ref().is_none_or(|max| version <= max);
        above_min && below_max
    }

    /// 範囲外の場合は `UnsupportedVersion` を返す
    pub fn check(&self, version: &ServerVersion) -> Result<()> {
        if self.contains(version) {
            return Ok(());
        }

        let bound = |v: &Option<ServerVersion>| {
            v.as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "*".to_string())
        };

        Err(Error::UnsupportedVersion {
            found: version.to_string(),
            min: bound(&self.min),
            max: bound(&self.max),
        })
    }
}
