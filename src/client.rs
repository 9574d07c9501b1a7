use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::COOKIE;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::models::SearchDefaults;
use crate::version::{DEFAULT_MIN_VERSION, ServerVersion, VersionRange};

const LOGIN_PATH: &str = "index.cgi";
const LOGOUT_PATH: &str = "relogin.cgi";
const ATTACHMENT_PATH: &str = "attachment.cgi";

/// 添付ファイルの内容（破棄すると接続を閉じる）
pub type AttachmentStream = Pin<Box<dyn AsyncRead + Send>>;

/// ログイン情報の提供元
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn name(&self) -> Result<String>;

    async fn password(&self) -> Result<String>;
}

/// 固定のログイン情報
#[derive(Clone)]
pub struct StaticCredentials {
    name: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn password(&self) -> Result<String> {
        Ok(self.password.clone())
    }
}

/// 環境変数からログイン情報を読む
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    user_var: String,
    password_var: String,
}

impl EnvCredentials {
    pub fn new(user_var: impl Into<String>, password_var: impl Into<String>) -> Self {
        Self {
            user_var: user_var.into(),
            password_var: password_var.into(),
        }
    }

    /// ユーザー名の環境変数が設定されている場合のみ返す
    pub fn detect() -> Option<Self> {
        let credentials = Self::default();
        std::env::var(&credentials.user_var).ok().map(|_| credentials)
    }

    fn read(var: &str) -> Result<String> {
        std::env::var(var)
            .map_err(|_| Error::ConfigurationMissing(format!("{} not found in environment", var)))
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("BUGZILLA_USER", "BUGZILLA_PASSWORD")
    }
}

#[async_trait]
impl CredentialSource for EnvCredentials {
    async fn name(&self) -> Result<String> {
        Self::read(&self.user_var)
    }

    async fn password(&self) -> Result<String> {
        Self::read(&self.password_var)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub base_url: String,
    /// サポートするサーバーバージョンの範囲
    pub versions: VersionRange,
    /// 検索リクエストの既定パラメータ
    pub search_defaults: SearchDefaults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,
}

impl TrackerConfig {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();

        // Validate URL
        let _ = Url::parse(&base_url)
            .map_err(|_| Error::InvalidConfiguration("Invalid base URL".to_string()))?;

        Ok(Self {
            base_url,
            versions: VersionRange::new(DEFAULT_MIN_VERSION.parse().ok(), None),
            search_defaults: SearchDefaults::default(),
            connect_timeout: None,
        })
    }

    pub fn from_env() -> Result<Self> {
        use std::env;

        dotenv::dotenv().ok();

        let base_url = env::var("BUGZILLA_URL")
            .map_err(|_| Error::ConfigurationMissing("BUGZILLA_URL not found in environment".to_string()))?;

        let mut config = Self::new(base_url)?;
        if let Ok(min) = env::var("BUGZILLA_MIN_VERSION") {
            config.versions.min = Some(min.parse()?);
        }
        if let Ok(max) = env::var("BUGZILLA_MAX_VERSION") {
            config.versions.max = Some(max.parse()?);
        }
        Ok(config)
    }

    pub fn min_version(mut self, version: Option<ServerVersion>) -> Self {
        self.versions.min = version;
        self
    }

    pub fn max_version(mut self, version: Option<ServerVersion>) -> Self {
        self.versions.max = version;
        self
    }

    pub fn search_defaults(mut self, defaults: SearchDefaults) -> Self {
        self.search_defaults = defaults;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// セッションのライフサイクル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Open,
    Closed,
}

/// トラッカーへの論理的な接続1つ
///
/// クッキーとログイン状態を保持する。状態を変更する操作は `&mut self` を取るため、
/// 複数のパイプラインから同時に使う場合は呼び出し側で直列化すること。
pub struct Session {
    pub(crate) client: Client,
    pub(crate) config: Arc<TrackerConfig>,
    pub(crate) base: Url,
    pub(crate) cookies: CookieJar,
    credentials: Option<Arc<dyn CredentialSource>>,
    version: Option<ServerVersion>,
    logged_in: bool,
    state: SessionState,
}

impl Session {
    pub fn new(
        config: TrackerConfig,
        credentials: Option<Arc<dyn CredentialSource>>,
    ) -> Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|_| Error::InvalidConfiguration("Invalid base URL".to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let host = base
            .host_str()
            .ok_or_else(|| Error::InvalidConfiguration("Base URL has no host".to_string()))?
            .to_string();

        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Unexpected(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: Arc::new(config),
            base,
            cookies: CookieJar::new(host),
            credentials,
            version: None,
            logged_in: false,
            state: SessionState::Created,
        })
    }

    pub fn anonymous(config: TrackerConfig) -> Result<Self> {
        Self::new(config, None)
    }

    pub fn with_credentials<C>(config: TrackerConfig, credentials: C) -> Result<Self>
    where
        C: CredentialSource + 'static,
    {
        Self::new(config, Some(Arc::new(credentials)))
    }

    /// 環境変数から設定とログイン情報（あれば）を読み込む
    pub fn from_env() -> Result<Self> {
        let config = TrackerConfig::from_env()?;
        let credentials =
            EnvCredentials::detect().map(|c| Arc::new(c) as Arc<dyn CredentialSource>);
        Self::new(config, credentials)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn version(&self) -> Option<&ServerVersion> {
        self.version.as_ref()
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// ログインしてサーバーバージョンを確認する
    ///
    /// ログイン情報が無い場合はログインせずにバージョンだけ確認する。通信エラーや
    /// ログイン拒否は記録したうえで匿名のまま開く。バージョンが範囲外なら失敗する。
    pub async fn open(&mut self) -> Result<()> {
        match self.state {
            SessionState::Open => return Ok(()),
            SessionState::Closed => {
                return Err(Error::IllegalState("session has been closed".to_string()));
            }
            SessionState::Created => {}
        }

        let body = match self.credentials.clone() {
            Some(credentials) => self.login(credentials.as_ref()).await?,
            None => self.probe().await,
        };

        let version = body.as_deref().and_then(ServerVersion::scan);
        match &version {
            Some(version) => {
                if let Err(e) = self.config.versions.check(version) {
                    error!(version = %version, error = %e, "Server version is not supported");
                    self.reset();
                    return Err(e);
                }
                info!(version = %version, logged_in = self.logged_in, "Session opened");
            }
            None => warn!(logged_in = self.logged_in, "Could not detect server version"),
        }

        self.version = version;
        self.state = SessionState::Open;
        Ok(())
    }

    /// ログアウトして状態を破棄する（ログアウトの成否は問わない）
    pub async fn close(&mut self) {
        if self.logged_in {
            match self.endpoint(LOGOUT_PATH) {
                Ok(url) => {
                    let request = self.request(Method::GET, url).query(&[("logout", "1")]);
                    match request.send().await {
                        Ok(response) => {
                            debug!(status = response.status().as_u16(), "Logged out");
                        }
                        Err(e) => warn!(error = %e, "Logout request failed"),
                    }
                }
                Err(e) => warn!(error = %e, "Cannot build logout URL"),
            }
        }

        self.reset();
        self.state = SessionState::Closed;
    }

    /// 添付ファイルの内容をストリームとして取得する
    pub async fn attachment_content(&mut self, id: &str) -> Result<AttachmentStream> {
        let url = self.endpoint(ATTACHMENT_PATH)?;
        let response = self
            .request(Method::GET, url)
            .query(&[("id", id)])
            .send()
            .await?;
        self.cookies.capture(response.headers());

        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::ApiError { status, message });
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(Box::pin(body))))
    }

    async fn login(&mut self, credentials: &dyn CredentialSource) -> Result<Option<String>> {
        let name = credentials.name().await?;
        let password = credentials.password().await?;
        let url = self.endpoint(LOGIN_PATH)?;

        let form = [
            ("Bugzilla_login", name.as_str()),
            ("Bugzilla_password", password.as_str()),
            ("GoAheadAndLogIn", "1"),
        ];
        let response = match self.request(Method::POST, url).form(&form).send().await {
            Ok(response) => response,
            Err(e) => {
                error!(user = %name, error = %e, "Login request failed");
                return Ok(None);
            }
        };

        let status = response.status();
        let captured = self.cookies.capture(response.headers());
        self.logged_in = status == StatusCode::OK && captured > 0;
        if self.logged_in {
            info!(user = %name, "Logged in");
        } else {
            warn!(user = %name, status = status.as_u16(), cookies = captured, "Login was not accepted");
        }

        Ok(Self::body_text(response).await)
    }

    /// 匿名アクセス時にバージョン確認のためだけにトップページを読む
    async fn probe(&mut self) -> Option<String> {
        let url = self.endpoint(LOGIN_PATH).ok()?;
        match self.request(Method::GET, url).send().await {
            Ok(response) => {
                self.cookies.capture(response.headers());
                Self::body_text(response).await
            }
            Err(e) => {
                error!(error = %e, "Could not reach tracker");
                None
            }
        }
    }

    async fn body_text(response: Response) -> Option<String> {
        match response.text().await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(error = %e, "Failed to read response body");
                None
            }
        }
    }

    fn reset(&mut self) {
        self.cookies.clear();
        self.logged_in = false;
        self.version = None;
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::InvalidConfiguration(format!("Invalid endpoint {}: {}", path, e)))
    }

    /// 保持しているクッキーをすべて1つのヘッダーにまとめて付与したリクエスト
    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match self.cookies.header_value() {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base", &self.base.as_str())
            .field("state", &self.state)
            .field("logged_in", &self.logged_in)
            .field("version", &self.version)
            .field("cookies", &self.cookies.len())
            .finish()
    }
}
