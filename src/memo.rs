use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::models::{
    Classification, Component, IssueType, Priority, Project, Resolution, Severity, Status,
};

type Transform<K, V> = Box<dyn Fn(&K) -> Option<V> + Send + Sync>;

/// キーごとに変換を一度だけ実行し、結果を共有インスタンスとして保持するキャッシュ
///
/// 同じキーに対しては常に同一の `Arc` を返すため、`Arc::ptr_eq` で同一性を比較できる。
/// 変換が `None` を返したキーはキャッシュしない。エビクションは行わない。
pub struct Memoizer<K, V> {
    cache: HashMap<K, Arc<V>>,
    transform: Transform<K, V>,
}

impl<K, V> Memoizer<K, V>
where
    K: Eq + Hash,
{
    pub fn new<F>(transform: F) -> Self
    where
        F: Fn(&K) -> Option<V> + Send + Sync + 'static,
    {
        Self {
            cache: HashMap::new(),
            transform: Box::new(transform),
        }
    }

    pub fn get(&mut self, key: K) -> Option<Arc<V>> {
        if let Some(value) = self.cache.get(&key) {
            return Some(Arc::clone(value));
        }

        let value = Arc::new((self.transform)(&key)?);
        self.cache.insert(key, Arc::clone(&value));
        Some(value)
    }

    /// 各キーを個別に解決し、変換結果が無いキーは読み飛ばす
    pub fn get_all<I>(&mut self, keys: I) -> Vec<Arc<V>>
    where
        I: IntoIterator<Item = K>,
    {
        keys.into_iter().filter_map(|key| self.get(key)).collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl<K, V> fmt::Debug for Memoizer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizer")
            .field("entries", &self.cache.len())
            .field("transform", &"<Fn>")
            .finish()
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty() && s != "---").then_some(s)
}

/// デコーダー1つ分のメタデータキャッシュ
#[derive(Debug)]
pub struct MetadataCache {
    pub statuses: Memoizer<String, Status>,
    pub resolutions: Memoizer<String, Resolution>,
    pub priorities: Memoizer<String, Priority>,
    pub severities: Memoizer<String, Severity>,
    pub issue_types: Memoizer<String, IssueType>,
    pub classifications: Memoizer<String, Classification>,
    pub projects: Memoizer<String, Project>,
    /// (プロダクト名, コンポーネント名)
    pub components: Memoizer<(String, String), Component>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self {
            statuses: Memoizer::new(|name: &String| non_blank(name).map(Status::new)),
            resolutions: Memoizer::new(|name: &String| non_blank(name).map(Resolution::new)),
            priorities: Memoizer::new(|name: &String| non_blank(name).map(Priority::new)),
            severities: Memoizer::new(|name: &String| non_blank(name).map(Severity::new)),
            issue_types: Memoizer::new(|name: &String| non_blank(name).map(IssueType::new)),
            classifications: Memoizer::new(|name: &String| {
                non_blank(name).map(Classification::new)
            }),
            projects: Memoizer::new(|name: &String| non_blank(name).map(Project::new)),
            components: Memoizer::new(|(project, name): &(String, String)| {
                let name = non_blank(name)?;
                Some(Component::new(name, non_blank(project)))
            }),
        }
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}
