use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{
        Request, Response, StatusCode,
        header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE},
    },
};
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use mockito::{Matcher, Mock, ServerGuard};
use relying_party::{
    AppState,
    auth::{MemoryUserStore, OpenIdConnectBackend},
    config::{OidcSettings, ServerConfig},
    install_crypto_provider,
    oidc::OidcClients,
    routes,
    session::{MemorySessionStore, SessionStore},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;

const CLIENT_SECRET: &str = "an-hmac-client-secret-of-32-bytes!";
const PUBLIC_BASE_URL: &str = "http://localhost:8081";

struct TestOp {
    server: ServerGuard,
    router: Router,
    sessions: Arc<MemorySessionStore>,
    _mocks: Vec<Mock>,
}

struct Options {
    create_unknown_user: bool,
    allow_dynamic_op: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_unknown_user: true,
            allow_dynamic_op: true,
        }
    }
}

impl TestOp {
    fn issuer(&self, path: &str) -> String {
        format!("{}{path}", self.server.url())
    }

    /// Stores a session directly and returns its cookie.
    async fn seed_session(&self, id: &str, data: Value) -> String {
        let Value::Object(data) = data else {
            panic!("session data must be an object");
        };
        self.sessions
            .save(id, &data, chrono::Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        format!("sessionid={id}")
    }
}

fn provider_metadata(issuer: &str, end_session: bool) -> Value {
    let mut metadata = json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
        "jwks_uri": format!("{issuer}/jwks"),
        "registration_endpoint": format!("{issuer}/register"),
        "response_types_supported": ["code"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["HS256"],
    });
    if end_session {
        metadata["end_session_endpoint"] = json!(format!("{issuer}/logout"));
    }
    metadata
}

async fn mock_discovery(server: &mut ServerGuard, path: &str, end_session: bool) -> Vec<Mock> {
    let issuer = format!("{}{path}", server.url());
    let discovery = server
        .mock("GET", format!("{path}/.well-known/openid-configuration").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(provider_metadata(&issuer, end_session).to_string())
        .create_async()
        .await;
    let jwks = server
        .mock("GET", format!("{path}/jwks").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"keys":[]}"#)
        .create_async()
        .await;
    vec![discovery, jwks]
}

async fn start() -> TestOp {
    start_with(Options::default()).await
}

async fn start_with(options: Options) -> TestOp {
    install_crypto_provider();

    let mut server = mockito::Server::new_async().await;
    let mut mocks = mock_discovery(&mut server, "/op", true).await;
    mocks.extend(mock_discovery(&mut server, "/broken", false).await);

    let settings = json!({
        "providers": {
            "mock": {
                "srv_discovery_url": format!("{}/op", server.url()),
                "behaviour": { "response_type": "code", "scope": ["openid", "email", "profile"] },
                "client_registration": {
                    "client_id": "rp",
                    "client_secret": CLIENT_SECRET,
                    "post_logout_redirect_uris": [
                        format!("{PUBLIC_BASE_URL}/"),
                        format!("{PUBLIC_BASE_URL}/openid/callback/logout"),
                    ]
                }
            },
            "broken": {
                "srv_discovery_url": format!("{}/broken", server.url()),
                "client_registration": { "client_id": "rp", "client_secret": CLIENT_SECRET }
            },
            "down": {
                "srv_discovery_url": format!("{}/down", server.url()),
                "client_registration": { "client_id": "rp" }
            }
        }
    });

    let mut config = ServerConfig::from_lookup(|_| None).unwrap();
    config.oidc.settings = OidcSettings::from_json(&settings.to_string())
        .unwrap()
        .with_public_base_url(PUBLIC_BASE_URL);
    config.oidc.allow_dynamic_op = options.allow_dynamic_op;
    config.oidc.create_unknown_user = options.create_unknown_user;

    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let clients = OidcClients::from_settings(&config.oidc.settings, http).await;
    let backend = OpenIdConnectBackend::new(
        Arc::new(MemoryUserStore::new()),
        config.oidc.create_unknown_user,
    );
    let sessions = Arc::new(MemorySessionStore::new());

    let state = AppState::new(
        config,
        Arc::new(clients),
        sessions.clone(),
        Arc::new(backend),
    );

    TestOp {
        server,
        router: routes::router(state),
        sessions,
        _mocks: mocks,
    }
}

async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut request = Request::get(uri);
    if let Some(cookie) = cookie {
        request = request.header(COOKIE, cookie);
    }
    request.body(Body::empty()).unwrap()
}

fn session_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .find(|pair| pair.starts_with("sessionid=") && pair.len() > "sessionid=".len())
        .map(str::to_string)
}

fn location(response: &Response<Body>) -> String {
    response.headers()[LOCATION].to_str().unwrap().to_string()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn sign_id_token(issuer: &str, nonce: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = json!({
        "iss": issuer,
        "sub": "alice-sub",
        "aud": "rp",
        "iat": now,
        "exp": now + 300,
        "nonce": nonce,
        "upn": "alice@corp.example",
        "given_name": "Alice",
    });
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(CLIENT_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn mock_token_and_userinfo(server: &mut ServerGuard, id_token: &str) -> [Mock; 2] {
    let token = server
        .mock("POST", "/op/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("code".into(), "auth-code".into()),
            Matcher::Regex("code_verifier=".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "access_token": "access-token",
                "token_type": "Bearer",
                "expires_in": 300,
                "id_token": id_token,
            })
            .to_string(),
        )
        .create_async()
        .await;
    let userinfo = server
        .mock("GET", "/op/userinfo")
        .match_header("authorization", "Bearer access-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"sub":"alice-sub","family_name":"Liddell","email":"alice@example.com"}"#)
        .create_async()
        .await;
    [token, userinfo]
}

#[tokio::test]
async fn login_page_lists_reachable_providers() {
    let op = start().await;

    let response = send(&op.router, get("/openid/login?next=/inbox", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_cookie(&response).is_some());

    let body = json_body(response).await;
    assert_eq!(body["op_list"], json!(["broken", "mock"]));
    assert_eq!(body["dynamic"], json!(true));
    assert_eq!(body["next"], json!("/inbox"));
    assert!(body.get("errors").is_none());
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let op = start().await;

    let response = send(&op.router, get("/openid/login/down", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "unknown_provider");
}

#[tokio::test]
async fn full_login_and_logout() {
    let mut op = start().await;
    let issuer = op.issuer("/op");

    // login redirect
    let response = send(&op.router, get("/openid/login/mock?next=/dashboard", None)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let cookie = session_cookie(&response).unwrap();
    let authorize = location(&response);
    assert!(authorize.starts_with(&format!("{issuer}/authorize")));
    assert_eq!(query_param(&authorize, "client_id").as_deref(), Some("rp"));
    assert_eq!(
        query_param(&authorize, "code_challenge_method").as_deref(),
        Some("S256")
    );
    let scope = query_param(&authorize, "scope").unwrap();
    assert!(scope.split(' ').any(|s| s == "openid"));
    assert!(scope.split(' ').any(|s| s == "email"));
    let state = query_param(&authorize, "state").unwrap();
    let nonce = query_param(&authorize, "nonce").unwrap();

    // token and userinfo
    let id_token = sign_id_token(&issuer, &nonce);
    let [token, userinfo] = mock_token_and_userinfo(&mut op.server, &id_token).await;

    let callback = format!("/openid/callback/login?code=auth-code&state={state}");
    let response = send(&op.router, get(&callback, Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/dashboard");
    let logged_in = session_cookie(&response).unwrap();
    assert_ne!(logged_in, cookie);
    token.assert_async().await;
    userinfo.assert_async().await;

    // the pre-login session id is gone
    let response = send(&op.router, get("/openid/me", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&op.router, get("/openid/me", Some(&logged_in))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let profile = json_body(response).await;
    assert_eq!(profile["username"], "alice@corp.example");
    assert_eq!(profile["first_name"], "Alice");
    assert_eq!(profile["last_name"], "Liddell");
    assert_eq!(profile["email"], "alice@example.com");
    assert_eq!(profile["op"], "mock");
    assert_eq!(profile["userinfo"]["upn"], "alice@corp.example");

    // logout at the OP
    let end_session = op
        .server
        .mock("GET", "/op/logout")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("state".into(), state.clone()),
            Matcher::UrlEncoded("id_token_hint".into(), id_token.clone()),
            Matcher::UrlEncoded(
                "post_logout_redirect_uri".into(),
                format!("{PUBLIC_BASE_URL}/openid/callback/logout"),
            ),
        ]))
        .with_status(302)
        .with_header("location", &format!("{PUBLIC_BASE_URL}/openid/callback/logout"))
        .with_header("x-op-session", "ended")
        .create_async()
        .await;

    let response = send(&op.router, get("/openid/logout", Some(&logged_in))).await;
    end_session.assert_async().await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        location(&response),
        format!("{PUBLIC_BASE_URL}/openid/callback/logout")
    );
    assert_eq!(response.headers()["x-op-session"], "ended");
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    let after_logout = session_cookie(&response).unwrap();

    let response = send(&op.router, get("/openid/me", Some(&after_logout))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&op.router, get("/openid/callback/logout", Some(&after_logout))).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/dashboard");
}

#[tokio::test]
async fn callback_with_wrong_state_is_rejected() {
    let op = start().await;

    let response = send(&op.router, get("/openid/login/mock", None)).await;
    let cookie = session_cookie(&response).unwrap();

    let response = send(
        &op.router,
        get("/openid/callback/login?code=abc&state=forged", Some(&cookie)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "state_mismatch");
    assert_eq!(body["callback"]["state"], json!(["forged"]));
}

#[tokio::test]
async fn provider_error_is_reported_with_callback_query() {
    let op = start().await;

    let response = send(&op.router, get("/openid/login/mock", None)).await;
    let cookie = session_cookie(&response).unwrap();

    let response = send(
        &op.router,
        get(
            "/openid/callback/login?error=access_denied&error_description=nope",
            Some(&cookie),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"], "access_denied");
    assert_eq!(body["callback"]["error_description"], json!(["nope"]));
}

#[tokio::test]
async fn callback_without_login_is_rejected() {
    let op = start().await;

    let response = send(&op.router, get("/openid/callback/login?code=abc", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_session");
}

#[tokio::test]
async fn logout_without_provider_is_local() {
    let op = start().await;

    let response = send(&op.router, get("/openid/login?next=/inbox", None)).await;
    let cookie = session_cookie(&response).unwrap();

    let response = send(
        &op.router,
        get("/openid/logout?next=https://evil.example.com/", Some(&cookie)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/");
    assert!(session_cookie(&response).is_none());
}

#[tokio::test]
async fn failed_end_session_falls_back_to_home() {
    let op = start().await;

    let response = send(&op.router, get("/openid/login/broken?next=/inbox", None)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let cookie = session_cookie(&response).unwrap();

    let response = send(&op.router, get("/openid/logout", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");

    let after_logout = session_cookie(&response).unwrap();
    let response = send(&op.router, get("/openid/callback/logout", Some(&after_logout))).await;
    assert_eq!(location(&response), "/inbox");
}

#[tokio::test]
async fn blank_hint_is_rejected() {
    let op = start().await;

    let request = Request::post("/openid/login")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("hint=+++"))
        .unwrap();
    let response = send(&op.router, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["errors"][0]["field"], "hint");
}

#[tokio::test]
async fn hint_discovers_and_registers_provider() {
    let mut op = start().await;
    let issuer = op.issuer("/dyn");

    let mut mocks = mock_discovery(&mut op.server, "/dyn", true).await;
    mocks.push(
        op.server
            .mock("GET", "/.well-known/webfinger")
            .match_query(Matcher::UrlEncoded(
                "rel".into(),
                "http://openid.net/specs/connect/1.0/issuer".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/jrd+json")
            .with_body(
                json!({
                    "subject": "acct:alice",
                    "links": [{ "rel": "http://openid.net/specs/connect/1.0/issuer", "href": issuer }]
                })
                .to_string(),
            )
            .create_async()
            .await,
    );
    let registration = op
        .server
        .mock("POST", "/dyn/register")
        .match_body(Matcher::PartialJson(json!({
            "redirect_uris": [format!("{PUBLIC_BASE_URL}/openid/callback/login")],
        })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(json!({ "client_id": "dyn-client", "client_secret": CLIENT_SECRET }).to_string())
        .expect(1)
        .create_async()
        .await;

    let hint = format!("{}/users/alice", op.server.url());
    let form = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("hint", &hint)
        .finish();

    for _ in 0..2 {
        let request = Request::post("/openid/login?next=/inbox")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.clone()))
            .unwrap();
        let response = send(&op.router, request).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let authorize = location(&response);
        assert!(authorize.starts_with(&format!("{issuer}/authorize")));
        assert_eq!(query_param(&authorize, "client_id").as_deref(), Some("dyn-client"));
    }

    // the second login reuses the first registration
    registration.assert_async().await;
}

#[tokio::test]
async fn refused_user_gets_forbidden() {
    let mut op = start_with(Options {
        create_unknown_user: false,
        ..Options::default()
    })
    .await;
    let issuer = op.issuer("/op");

    let response = send(&op.router, get("/openid/login/mock?next=/dashboard", None)).await;
    let cookie = session_cookie(&response).unwrap();
    let authorize = location(&response);
    let state = query_param(&authorize, "state").unwrap();
    let nonce = query_param(&authorize, "nonce").unwrap();

    let id_token = sign_id_token(&issuer, &nonce);
    let _mocks = mock_token_and_userinfo(&mut op.server, &id_token).await;

    let callback = format!("/openid/callback/login?code=auth-code&state={state}");
    let response = send(&op.router, get(&callback, Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        json_body(response).await["error"],
        "this login is not valid in this application"
    );

    let response = send(&op.router, get("/openid/me", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn hint_login_without_dynamic_providers_shows_login_page() {
    let op = start_with(Options {
        allow_dynamic_op: false,
        ..Options::default()
    })
    .await;

    let request = Request::post("/openid/login?next=/inbox")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("hint=alice%40example.com"))
        .unwrap();
    let response = send(&op.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["op_list"], json!(["broken", "mock"]));
    assert_eq!(body["dynamic"], json!(false));
    assert_eq!(body["next"], json!("/inbox"));
}

#[tokio::test]
async fn logout_with_unknown_provider_is_local() {
    let op = start().await;
    let cookie = op
        .seed_session(
            "unknown-op-session",
            json!({ "op": "retired", "state": "abc", "next": "/inbox" }),
        )
        .await;

    let response = send(&op.router, get("/openid/logout", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/");
    assert!(session_cookie(&response).is_none());
    assert!(op.sessions.load("unknown-op-session").await.unwrap().is_none());
}

#[tokio::test]
async fn logout_without_state_falls_back_to_home() {
    let op = start().await;
    let cookie = op
        .seed_session("stateless-session", json!({ "op": "mock", "next": "/inbox" }))
        .await;

    let response = send(&op.router, get("/openid/logout", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    assert!(op.sessions.load("stateless-session").await.unwrap().is_none());

    let after_logout = session_cookie(&response).unwrap();
    let response = send(&op.router, get("/openid/callback/logout", Some(&after_logout))).await;
    assert_eq!(location(&response), "/inbox");
}

#[tokio::test]
async fn logout_with_control_characters_in_next_redirects_home() {
    let op = start().await;

    let response = send(&op.router, get("/openid/logout?next=/%0Ainjected", None)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/");

    let response = send(&op.router, get("/openid/login?next=/a%0D%0Ab", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["next"], json!("/"));
}
