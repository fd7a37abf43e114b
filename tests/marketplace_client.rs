use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use sea_orm::DatabaseConnection;
use serde_json::json;
use storefront_api::{
    config::MarketplaceConfig,
    db::{establish_connection, run_migrations},
    services::marketplace::{MarketplaceClient, MarketplaceError},
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn test_db() -> Arc<DatabaseConnection> {
    let pool = establish_connection("sqlite::memory:")
        .await
        .expect("sqlite connection");
    run_migrations(&pool).await.expect("migrations");
    Arc::new(pool)
}

fn client_for(server: &MockServer, db: Arc<DatabaseConnection>) -> MarketplaceClient {
    let config = MarketplaceConfig {
        base_url: server.uri(),
        email: "ops@storefront.example".into(),
        password: "secret".into(),
        request_timeout_secs: 5,
        token_refresh_window_secs: 300,
    };
    MarketplaceClient::new(db, &config).expect("client")
}

fn auth_body(token: &str, expires_in_secs: i64) -> serde_json::Value {
    json!({
        "accessToken": token,
        "accessExp": Utc::now().timestamp() + expires_in_secs,
        "signature": "sig",
        "user": { "qid": "user-1" },
    })
}

#[tokio::test]
async fn login_persists_token_and_requests_use_it() {
    let server = MockServer::start().await;
    let db = test_db().await;

    Mock::given(method("POST"))
        .and(path("/auth/login/"))
        .and(body_json(json!({
            "email": "ops@storefront.example",
            "password": "secret",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok-1", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ping"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, db);
    client.initialize().await.expect("login");

    let response = client
        .request(Method::GET, "ping", None)
        .await
        .expect("request");
    assert_eq!(response["ok"], json!(true));
}

#[tokio::test]
async fn rejected_request_triggers_one_relogin_and_retry() {
    let server = MockServer::start().await;
    let db = test_db().await;

    // First login hands out a token the API then revokes
    Mock::given(method("POST"))
        .and(path("/auth/login/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok-1", 3600)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok-2", 3600)))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401).set_body_string("revoked"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, db);
    client.initialize().await.expect("login");

    let response = client
        .request(Method::GET, "orders", None)
        .await
        .expect("retried request");
    assert!(response["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn persistent_rejection_surfaces_as_auth_error() {
    let server = MockServer::start().await;
    let db = test_db().await;

    Mock::given(method("POST"))
        .and(path("/auth/login/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok-1", 3600)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
        .mount(&server)
        .await;

    let client = client_for(&server, db);
    client.initialize().await.expect("login");

    let err = client
        .request(Method::GET, "orders", None)
        .await
        .expect_err("should fail");
    assert!(matches!(err, MarketplaceError::UpstreamAuth));
}

#[tokio::test]
async fn near_expiry_token_is_refreshed_before_use() {
    let server = MockServer::start().await;
    let db = test_db().await;

    // Token expires inside the refresh window
    Mock::given(method("POST"))
        .and(path("/auth/login/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok-old", 60)))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh/"))
        .and(header("authorization", "Bearer tok-old"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok-new", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, db);
    client.initialize().await.expect("login");

    let token = client.valid_access_token().await.expect("token");
    assert_eq!(token, "tok-new");

    // The refreshed token is now the stored one; no second refresh
    let token = client.valid_access_token().await.expect("token");
    assert_eq!(token, "tok-new");
}

#[tokio::test]
async fn rejected_refresh_falls_back_to_login() {
    let server = MockServer::start().await;
    let db = test_db().await;

    Mock::given(method("POST"))
        .and(path("/auth/login/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok-old", 60)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok-new", 3600)))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh/"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, db);
    client.initialize().await.expect("login");

    let token = client.valid_access_token().await.expect("token");
    assert_eq!(token, "tok-new");
}

#[tokio::test]
async fn request_without_any_session_fails() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let client = client_for(&server, db);

    let err = client
        .request(Method::GET, "orders", None)
        .await
        .expect_err("no token on record");
    assert!(matches!(err, MarketplaceError::NoToken));
}
