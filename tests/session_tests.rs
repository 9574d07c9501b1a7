/// セッション（ログイン・バージョン確認・検索・ログアウト）の統合テスト
///
/// wiremockでトラッカーを模擬するため、実サーバーは不要:
/// ```
/// cargo test --test session_tests
/// ```

use bugzilla_scraper::{
    Error, SearchParams, Session, SessionState, StaticCredentials, TrackerConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncReadExt;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FRONT_PAGE: &str = "<html>\n<head><title>Bugzilla Main Page</title></head>\n<body>\n<p class=\"header_addl_info\">version 4.4.12</p>\n</body>\n</html>";

fn results_page(ids: &[&str]) -> String {
    let mut body = String::from("<html><body><table>\n");
    for id in ids {
        body.push_str(&format!(
            "<tr><td><a href=\"show_bug.cgi?id={id}\">{id}</a></td></tr>\n"
        ));
    }
    body.push_str("</table></body></html>");
    body
}

/// ログインを受け付けてクッキーを2つ発行するモックを登録
async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/index.cgi"))
        .and(body_string_contains("Bugzilla_login=jo%40example.org"))
        .and(body_string_contains("GoAheadAndLogIn=1"))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("set-cookie", "Bugzilla_login=42; path=/; HttpOnly")
                .append_header("set-cookie", "Bugzilla_logincookie=abc; path=/")
                .set_body_string(FRONT_PAGE),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn logged_in_session(server: &MockServer) -> Session {
    mount_login(server).await;
    let config = TrackerConfig::new(server.uri()).unwrap();
    let mut session =
        Session::with_credentials(config, StaticCredentials::new("jo@example.org", "secret"))
            .unwrap();
    session.open().await.unwrap();
    session
}

#[tokio::test]
async fn test_login_captures_cookies_and_version() {
    // Given: ログインを受け付けるトラッカー
    let server = MockServer::start().await;

    // When: ログイン情報付きでセッションを開く
    let session = logged_in_session(&server).await;

    // Then: クッキーとバージョンが取り込まれる
    assert_eq!(session.state(), SessionState::Open);
    assert!(session.is_logged_in());
    assert_eq!(session.cookies().len(), 2);
    assert_eq!(session.version().unwrap().as_str(), "4.4.12");
}

#[tokio::test]
async fn test_cookies_are_replayed_on_search() {
    // Given: ログイン済みのセッションと、クッキーを要求する検索ページ
    let server = MockServer::start().await;
    let mut session = logged_in_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/buglist.cgi"))
        .and(header("cookie", "Bugzilla_login=42; Bugzilla_logincookie=abc"))
        .and(query_param("product", "Widgets"))
        .and(query_param("query_format", "advanced"))
        .respond_with(ResponseTemplate::new(200).set_body_string(results_page(&["7", "9", "7"])))
        .expect(1)
        .mount(&server)
        .await;

    // When: 検索する
    let ids = session
        .search(&SearchParams::new().product("Widgets"))
        .await;

    // Then: 重複を除いたIDが出現順に返る
    assert_eq!(ids, Some(vec!["7".to_string(), "9".to_string()]));
}

#[tokio::test]
async fn test_caller_params_override_defaults() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FRONT_PAGE))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/buglist.cgi"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_string(results_page(&["3"])))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = Session::anonymous(TrackerConfig::new(server.uri()).unwrap()).unwrap();
    session.open().await.unwrap();

    let ids = session
        .search(&SearchParams::new().param("limit", "5"))
        .await
        .unwrap();

    assert_eq!(ids, vec!["3"]);
}

#[tokio::test]
async fn test_anonymous_open_only_checks_version() {
    // Given: ログイン情報なしのセッション
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FRONT_PAGE))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/index.cgi"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let mut session = Session::anonymous(TrackerConfig::new(server.uri()).unwrap()).unwrap();

    // When: 2回開く
    session.open().await.unwrap();
    session.open().await.unwrap();

    // Then: ログインせず、バージョン確認は1回だけ
    assert!(!session.is_logged_in());
    assert_eq!(session.version().unwrap().as_str(), "4.4.12");
}

#[tokio::test]
async fn test_unsupported_version_fails_open() {
    // Given: 最小バージョンより古いトラッカー
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>Version 2.22.7</p>"))
        .mount(&server)
        .await;
    let mut session = Session::anonymous(TrackerConfig::new(server.uri()).unwrap()).unwrap();

    // When: セッションを開く
    let result = session.open().await;

    // Then: UnsupportedVersionエラー
    match result {
        Err(Error::UnsupportedVersion { found, min, max }) => {
            assert_eq!(found, "2.22.7");
            assert_eq!(min, "3.0");
            assert_eq!(max, "*");
        }
        other => panic!("Expected UnsupportedVersion, got {:?}", other),
    }
    assert_ne!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_max_version_bound_is_enforced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FRONT_PAGE))
        .mount(&server)
        .await;
    let config = TrackerConfig::new(server.uri())
        .unwrap()
        .max_version(Some("4.2".parse().unwrap()));
    let mut session = Session::anonymous(config).unwrap();

    assert!(matches!(
        session.open().await,
        Err(Error::UnsupportedVersion { .. })
    ));
}

#[tokio::test]
async fn test_unreachable_tracker_degrades_to_anonymous() {
    // Given: 接続できないアドレス
    let config = TrackerConfig::new("http://127.0.0.1:9/")
        .unwrap()
        .connect_timeout(std::time::Duration::from_millis(200));
    let mut session =
        Session::with_credentials(config, StaticCredentials::new("jo@example.org", "secret"))
            .unwrap();

    // When: セッションを開く
    let result = session.open().await;

    // Then: 失敗せず、匿名・バージョン不明のまま開く
    assert!(result.is_ok());
    assert_eq!(session.state(), SessionState::Open);
    assert!(!session.is_logged_in());
    assert!(session.version().is_none());

    // 検索も失敗を値として返す
    assert!(session.search(&SearchParams::new()).await.is_none());
}

#[tokio::test]
async fn test_search_non_ok_status_returns_none() {
    let server = MockServer::start().await;
    let mut session = logged_in_session(&server).await;
    Mock::given(method("GET"))
        .and(path("/buglist.cgi"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Error"))
        .mount(&server)
        .await;

    assert!(session.search(&SearchParams::new()).await.is_none());

    let mut called = false;
    let mut issues = session
        .search_with_count(&SearchParams::new(), |_| called = true)
        .await;
    assert!(!called);
    assert!(!issues.has_next());
    assert!(matches!(issues.next().await, Err(Error::IllegalState(_))));
}

#[tokio::test]
async fn test_search_with_count_reports_before_fetch() {
    // Given: 2件ヒットする検索
    let server = MockServer::start().await;
    let mut session = logged_in_session(&server).await;
    Mock::given(method("GET"))
        .and(path("/buglist.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(results_page(&["7", "9"])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/show_bug.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<bugzilla><bug><bug_id>7</bug_id></bug><bug><bug_id>9</bug_id></bug></bugzilla>",
        ))
        .mount(&server)
        .await;

    // When: 件数通知付きで検索する
    let count = Arc::new(AtomicUsize::new(usize::MAX));
    let seen = Arc::clone(&count);
    let mut issues = session
        .search_with_count(&SearchParams::new(), move |n| seen.store(n, Ordering::SeqCst))
        .await;

    // Then: 取得開始前に件数が通知される
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(!issues.is_started());
    assert_eq!(issues.requested(), 2);
    assert_eq!(issues.next().await.unwrap().id, "7");
    assert_eq!(issues.next().await.unwrap().id, "9");
    assert!(!issues.has_next());
}

#[tokio::test]
async fn test_attachment_content_streams_body() {
    let server = MockServer::start().await;
    let mut session = logged_in_session(&server).await;
    Mock::given(method("GET"))
        .and(path("/attachment.cgi"))
        .and(query_param("id", "501"))
        .and(header("cookie", "Bugzilla_login=42; Bugzilla_logincookie=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"diff --git a/x b/x\n".to_vec()))
        .mount(&server)
        .await;

    let mut content = session.attachment_content("501").await.unwrap();
    let mut bytes = Vec::new();
    content.read_to_end(&mut bytes).await.unwrap();

    assert_eq!(bytes, b"diff --git a/x b/x\n");
}

#[tokio::test]
async fn test_attachment_content_not_found() {
    let server = MockServer::start().await;
    let mut session = logged_in_session(&server).await;
    Mock::given(method("GET"))
        .and(path("/attachment.cgi"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Invalid Attachment ID"))
        .mount(&server)
        .await;

    match session.attachment_content("999").await {
        Err(Error::ApiError { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Invalid Attachment ID");
        }
        Ok(_) => panic!("Expected ApiError"),
        Err(other) => panic!("Expected ApiError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_logs_out_and_forgets_cookies() {
    // Given: ログイン済みのセッション
    let server = MockServer::start().await;
    let mut session = logged_in_session(&server).await;
    Mock::given(method("GET"))
        .and(path("/relogin.cgi"))
        .and(query_param("logout", "1"))
        .and(header("cookie", "Bugzilla_login=42; Bugzilla_logincookie=abc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // When: 閉じる
    session.close().await;

    // Then: ログアウトされ、状態が破棄される
    assert!(session.is_closed());
    assert!(!session.is_logged_in());
    assert!(session.cookies().is_empty());
    assert!(session.version().is_none());

    // 閉じたセッションは再び開けず、取得も行わない
    assert!(matches!(session.open().await, Err(Error::IllegalState(_))));
    assert!(!session.fetch(["1"]).has_next());
}

#[tokio::test]
async fn test_rejected_login_stays_anonymous() {
    // Given: クッキーを発行しないログイン応答
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/index.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FRONT_PAGE))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/relogin.cgi"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let config = TrackerConfig::new(server.uri()).unwrap();
    let mut session =
        Session::with_credentials(config, StaticCredentials::new("jo@example.org", "wrong"))
            .unwrap();

    // When: 開いて閉じる
    session.open().await.unwrap();
    assert!(!session.is_logged_in());
    session.close().await;

    // Then: ログアウト要求は送られない（expect(0)で検証）
    assert!(session.is_closed());
}
