use serde::{Deserialize, Serialize};

/// 検索パラメータ（名前と値の順序付きリスト、同名の複数指定可）
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SearchParams {
    pairs: Vec<(String, String)>,
}

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((name.into(), value.into()));
        self
    }

    pub fn product(self, product: impl Into<String>) -> Self {
        self.param("product", product)
    }

    pub fn component(self, component: impl Into<String>) -> Self {
        self.param("component", component)
    }

    pub fn status(self, status: impl Into<String>) -> Self {
        self.param("bug_status", status)
    }

    pub fn changed_since(self, date: impl Into<String>) -> Self {
        self.param("chfieldfrom", date)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn contains(&self, name: &str) -> bool {
        self.pairs.iter().any(|(n, _)| n == name)
    }
}

impl<K, V> FromIterator<(K, V)> for SearchParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// 検索リクエストに常に付与される既定パラメータ
///
/// セッション生成時に一度だけ組み立て、以後は変更しない。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchDefaults {
    params: SearchParams,
}

impl SearchDefaults {
    pub fn new(params: SearchParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    /// 既定値に呼び出し側の値を重ねる（同名パラメータは呼び出し側が優先）
    pub fn merge(&self, overrides: &SearchParams) -> Vec<(String, String)> {
        self.params
            .pairs
            .iter()
            .filter(|(name, _)| !overrides.contains(name))
            .chain(overrides.pairs.iter())
            .cloned()
            .collect()
    }
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self::new(
            SearchParams::new()
                .param("query_format", "advanced")
                .param("order", "bug_id")
                .param("limit", "0"),
        )
    }
}
