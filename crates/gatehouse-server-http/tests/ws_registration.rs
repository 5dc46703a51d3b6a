//! WebSocket registration and public forwarding against a live gateway

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use gatehouse_auth::{hash_password, AccountClaims, JwtValidator};
use gatehouse_control::{AdmissionConfig, RequestForwarder, TunnelAdmission, TunnelRegistry};
use gatehouse_http_auth::{
    AuthDispatcher, DispatcherConfig, PolicyMutations, PolicyResolver, RateLimitResolver,
};
use gatehouse_proto::{
    Envelope, ForwardRequest, ForwardResponse, RegisterRequest, RegisterResponse, WireHeaders,
    MSG_REGISTER, MSG_REGISTERED, MSG_REQUEST, MSG_RESPONSE,
};
use gatehouse_server_http::{router, serve, GatewayConfig, GatewayState};
use gatehouse_store::{
    Account, Application, AuthMode, AuthPolicy, BasicCredential, MemoryStore, Organization, Plan,
    PlanLimits, PolicyOwner, PolicyType,
};
use gatehouse_usage::quota::checker_for;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

const SECRET: &[u8] = b"gateway-secret";
const DOMAIN: &str = "tunnels.test";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Gateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    registry: Arc<TunnelRegistry>,
    token: String,
}

async fn gateway() -> Gateway {
    let store = Arc::new(MemoryStore::new());
    store.insert_plan(Plan {
        id: "metered".into(),
        name: "Metered".into(),
        limits: PlanLimits {
            requests: 10,
            ..PlanLimits::unlimited()
        },
        overage_percent: 0,
        grace_period_hours: 0,
    });
    store.insert_organization(Organization {
        id: "org-1".into(),
        name: "Acme".into(),
        plan_id: Some("metered".into()),
        ip_whitelist: Vec::new(),
        created_at: Utc::now(),
    });
    store.insert_account(Account {
        id: "alice".into(),
        email: "alice@example.com".into(),
        org_id: Some("org-1".into()),
        ip_whitelist: Vec::new(),
        is_active: true,
        created_at: Utc::now(),
    });
    store.insert_application(Application {
        id: "app-1".into(),
        org_id: "org-1".into(),
        name: "Shop".into(),
        subdomain: "shop".into(),
        auth_mode: AuthMode::Custom,
        rate_limit: None,
        created_at: Utc::now(),
    });
    let mut policy = AuthPolicy::new(PolicyOwner::App("app-1".into()), PolicyType::Basic);
    policy.basic_users = vec![BasicCredential {
        username: "bob".into(),
        password_hash: hash_password("hunter2").unwrap(),
    }];
    policy.session_ttl_secs = 3600;
    store.insert_policy(policy);

    let jwt = JwtValidator::new(SECRET);
    let token = jwt
        .issue(&AccountClaims::new("alice", chrono::Duration::hours(1)))
        .unwrap();

    let registry = Arc::new(TunnelRegistry::new());
    let quota = Arc::new(checker_for(store.clone()));
    let admission = Arc::new(TunnelAdmission::new(
        store.clone(),
        Some(jwt),
        registry.clone(),
        quota.clone(),
        AdmissionConfig {
            domain: DOMAIN.into(),
            scheme: "https".into(),
        },
    ));
    let rate_limits = Arc::new(RateLimitResolver::new(store.clone(), None));
    let resolver = Arc::new(PolicyResolver::new(store.clone()));
    let state = Arc::new(GatewayState {
        admission,
        resolver: resolver.clone(),
        mutations: Arc::new(PolicyMutations::new(
            store.clone(),
            resolver,
            rate_limits.clone(),
        )),
        dispatcher: Arc::new(AuthDispatcher::new(
            store.clone(),
            rate_limits,
            DispatcherConfig::default(),
        )),
        quota,
        forwarder: RequestForwarder::default(),
        oidc: None,
        config: GatewayConfig {
            secure_cookies: false,
            ..GatewayConfig::default()
        },
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state.clone()));

    Gateway {
        addr,
        state,
        registry,
        token,
    }
}

async fn connect(gw: &Gateway) -> Client {
    let url = format!("ws://{}/_gatehouse/tunnel", gw.addr);
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn next_envelope(client: &mut Client) -> Option<Envelope> {
    loop {
        match client.next().await? {
            Ok(Message::Text(text)) => return Some(Envelope::decode(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn register(client: &mut Client, subdomain: &str, token: Option<&str>) -> RegisterResponse {
    let request = RegisterRequest {
        subdomain: subdomain.into(),
        token: token.map(String::from),
        secret: None,
    };
    let envelope = Envelope::new(MSG_REGISTER, &request).unwrap();
    client
        .send(Message::Text(envelope.encode().unwrap()))
        .await
        .unwrap();

    let reply = next_envelope(client).await.expect("no registration reply");
    assert_eq!(reply.kind, MSG_REGISTERED);
    reply.payload_as().unwrap()
}

/// Answer exactly one forwarded request with `status` and `body`
async fn answer_one(client: &mut Client, status: u16, body: &[u8]) -> ForwardRequest {
    let envelope = next_envelope(client).await.expect("no forwarded request");
    assert_eq!(envelope.kind, MSG_REQUEST);
    let request: ForwardRequest = envelope.payload_as().unwrap();
    let response = ForwardResponse {
        id: request.id.clone(),
        status_code: status,
        headers: WireHeaders::from([("content-type".to_string(), vec!["text/plain".to_string()])]),
        body: body.to_vec(),
    };
    let reply = Envelope::new(MSG_RESPONSE, &response).unwrap();
    client
        .send(Message::Text(reply.encode().unwrap()))
        .await
        .unwrap();
    request
}

fn public_request(subdomain: &str, path: &str) -> axum::http::request::Builder {
    Request::builder()
        .uri(path)
        .header(header::HOST, format!("{}.{}", subdomain, DOMAIN))
}

#[tokio::test]
async fn test_register_returns_public_url() {
    let gw = gateway().await;
    let mut client = connect(&gw).await;

    let reply = register(&mut client, "demo", Some(&gw.token)).await;
    assert!(reply.success, "{:?}", reply.error);
    assert_eq!(reply.subdomain, "demo");
    assert_eq!(reply.url.as_deref(), Some("https://demo.tunnels.test"));
    assert!(gw.registry.contains("demo"));
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let gw = gateway().await;
    let mut first = connect(&gw).await;
    assert!(register(&mut first, "demo", Some(&gw.token)).await.success);

    let mut second = connect(&gw).await;
    let reply = register(&mut second, "demo", Some(&gw.token)).await;
    assert!(!reply.success);
    assert_eq!(reply.error.as_deref(), Some("Subdomain already in use: demo"));
    assert!(next_envelope(&mut second).await.is_none());

    // The first tunnel is untouched
    assert_eq!(gw.registry.len(), 1);
}

#[tokio::test]
async fn test_registration_without_credentials_rejected() {
    let gw = gateway().await;
    let mut client = connect(&gw).await;
    let reply = register(&mut client, "demo", None).await;
    assert!(!reply.success);
    assert_eq!(reply.error.as_deref(), Some("Missing credentials"));
    assert!(gw.registry.is_empty());
}

#[tokio::test]
async fn test_public_request_forwarded() {
    let gw = gateway().await;
    let mut client = connect(&gw).await;
    assert!(register(&mut client, "demo", Some(&gw.token)).await.success);

    let app = router(gw.state.clone());
    let call = tokio::spawn(async move {
        app.oneshot(
            public_request("demo", "/items?page=2")
                .method("POST")
                .body(Body::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap()
    });

    let forwarded = answer_one(&mut client, 201, b"created").await;
    assert_eq!(forwarded.method, "POST");
    assert_eq!(forwarded.path, "/items?page=2");
    assert_eq!(forwarded.body, b"payload");
    assert!(forwarded.headers.contains_key("x-forwarded-for"));

    let response = call.await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["content-type"], "text/plain");
    let body = to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"created");
}

#[tokio::test]
async fn test_unknown_subdomain_is_404() {
    let gw = gateway().await;
    let response = router(gw.state.clone())
        .oneshot(public_request("nobody", "/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_basic_policy_redirects_to_login() {
    let gw = gateway().await;
    let mut client = connect(&gw).await;
    assert!(register(&mut client, "shop", Some(&gw.token)).await.success);

    let response = router(gw.state.clone())
        .oneshot(public_request("shop", "/dashboard").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "/_gatehouse/login?rd=%2Fdashboard"
    );

    let form = router(gw.state.clone())
        .oneshot(
            public_request("shop", "/_gatehouse/login?rd=%2Fdashboard")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(form.status(), StatusCode::OK);
    let page = to_bytes(form.into_body(), 64 * 1024).await.unwrap();
    assert!(String::from_utf8_lossy(&page).contains("value=\"/dashboard\""));
}

#[tokio::test]
async fn test_auth_mode_change_applies_to_next_request() {
    let gw = gateway().await;
    let mut client = connect(&gw).await;
    assert!(register(&mut client, "shop", Some(&gw.token)).await.success);

    let guarded = router(gw.state.clone())
        .oneshot(public_request("shop", "/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(guarded.status(), StatusCode::FOUND);

    // The org has no policy of its own, so inheriting it opens the app up
    gw.state
        .mutations
        .set_app_auth_mode("app-1", AuthMode::Inherit)
        .await
        .unwrap();

    let app = router(gw.state.clone());
    let call = tokio::spawn(async move {
        app.oneshot(public_request("shop", "/").body(Body::empty()).unwrap())
            .await
            .unwrap()
    });
    answer_one(&mut client, 200, b"open").await;
    assert_eq!(call.await.unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn test_login_form_sets_session_cookie() {
    let gw = gateway().await;
    let mut client = connect(&gw).await;
    assert!(register(&mut client, "shop", Some(&gw.token)).await.success);

    let bad = router(gw.state.clone())
        .oneshot(
            public_request("shop", "/_gatehouse/login")
                .method("POST")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=bob&password=wrong&rd=%2Fdashboard"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);

    let good = router(gw.state.clone())
        .oneshot(
            public_request("shop", "/_gatehouse/login")
                .method("POST")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=bob&password=hunter2&rd=%2Fdashboard"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(good.status(), StatusCode::SEE_OTHER);
    assert_eq!(good.headers()[header::LOCATION], "/dashboard");
    let cookie = good.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
    let session = cookie.split(';').next().unwrap().to_string();

    // The cookie alone now gets through to the tunnel
    let app = router(gw.state.clone());
    let call = tokio::spawn(async move {
        app.oneshot(
            public_request("shop", "/dashboard")
                .header(header::COOKIE, session)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    });
    answer_one(&mut client, 200, b"welcome").await;
    assert_eq!(call.await.unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn test_basic_header_forwards_with_quota_headers() {
    let gw = gateway().await;
    let mut client = connect(&gw).await;
    assert!(register(&mut client, "shop", Some(&gw.token)).await.success);

    let credentials = format!("Basic {}", STANDARD.encode("bob:hunter2"));
    let app = router(gw.state.clone());
    let call = tokio::spawn(async move {
        app.oneshot(
            public_request("shop", "/")
                .header(header::AUTHORIZATION, credentials)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    });
    answer_one(&mut client, 200, b"ok").await;

    let response = call.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-quota-limit"], "10");
    assert!(response.headers().contains_key(header::SET_COOKIE));
    assert_eq!(gw.state.quota.usage().current_usage("org-1").requests, 1);
}

#[tokio::test]
async fn test_disconnect_fails_in_flight_requests() {
    let gw = gateway().await;
    let mut client = connect(&gw).await;
    assert!(register(&mut client, "demo", Some(&gw.token)).await.success);

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let app = router(gw.state.clone());
            tokio::spawn(async move {
                app.oneshot(
                    public_request("demo", &format!("/slow/{}", i))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap()
            })
        })
        .collect();

    for _ in 0..3 {
        let envelope = next_envelope(&mut client).await.unwrap();
        assert_eq!(envelope.kind, MSG_REQUEST);
    }
    drop(client);

    for call in calls {
        let response = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("request not failed promptly")
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while gw.registry.contains("demo") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subdomain not released");
}
