use reqwest::header::{HeaderMap, HeaderValue, SET_COOKIE};
use tracing::debug;

/// サーバーから受け取ったクッキー1件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
}

impl Cookie {
    /// `Set-Cookie` ヘッダー値を解析する（名前と値、Domain属性、削除指定のみ扱う）
    ///
    /// 戻り値の2番目は `Max-Age=0` などによる削除指定かどうか。
    pub fn parse(header: &str) -> Option<(Cookie, bool)> {
        let mut segments = header.split(';');
        let (name, value) = segments.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut domain = None;
        let mut expired = false;
        for attr in segments {
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            let val = val.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    domain = Some(val.trim_start_matches('.').to_ascii_lowercase());
                }
                "max-age" => expired = val.parse::<i64>().is_ok_and(|age| age <= 0),
                _ => {}
            }
        }

        let value = value.trim().trim_matches('"').to_string();
        let removal = expired || value.is_empty();
        Some((
            Cookie {
                name: name.to_string(),
                value,
                domain,
            },
            removal,
        ))
    }

    /// Domain属性が無いか、ホストと一致する（またはホストがそのサブドメインである）場合のみ真
    pub fn matches_host(&self, host: &str) -> bool {
        match &self.domain {
            None => true,
            Some(domain) => {
                let host = host.to_ascii_lowercase();
                host == *domain || host.ends_with(&format!(".{}", domain))
            }
        }
    }
}

/// セッション用のクッキージャー
///
/// 受け取り順を保持し、同名のクッキーは後勝ちで置き換える。
#[derive(Debug, Clone)]
pub struct CookieJar {
    host: String,
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            cookies: Vec::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// `Set-Cookie` ヘッダー値を1件取り込む。保持した場合は真を返す
    pub fn store(&mut self, header: &str) -> bool {
        let Some((cookie, removal)) = Cookie::parse(header) else {
            debug!(header, "Ignoring unparsable Set-Cookie header");
            return false;
        };

        if !cookie.matches_host(&self.host) {
            debug!(
                cookie = %cookie.name,
                domain = ?cookie.domain,
                host = %self.host,
                "Rejecting cookie for foreign domain"
            );
            return false;
        }

        self.cookies.retain(|c| c.name != cookie.name);
        if removal {
            return false;
        }
        self.cookies.push(cookie);
        true
    }

    /// レスポンスヘッダーのすべての `Set-Cookie` を取り込み、取り込んだ件数を返す
    pub fn capture(&mut self, headers: &HeaderMap) -> usize {
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter(|value| self.store(value))
            .count()
    }

    /// リクエストに付与する `Cookie` ヘッダー値（空なら None）
    pub fn header_value(&self) -> Option<HeaderValue> {
        if self.cookies.is_empty() {
            return None;
        }
        let joined = self
            .cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }
}
