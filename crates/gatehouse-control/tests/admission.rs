//! Admission and teardown against the in-memory store

use async_trait::async_trait;
use chrono::Utc;
use gatehouse_auth::{generate_api_key, AccountClaims, JwtValidator};
use gatehouse_control::{
    record_id, AdmissionConfig, AdmissionError, Credential, ErrorKind, ForwardError,
    PendingRequests, RequestForwarder, TransportError, TunnelAdmission, TunnelRegistry,
    TunnelTransport,
};
use gatehouse_proto::{ForwardRequest, TransportKind, WireHeaders};
use gatehouse_router::RegistryError;
use gatehouse_store::{
    Account, ApiKey, Application, AuthMode, MemoryStore, Organization, Plan, PlanLimits,
};
use gatehouse_usage::quota::{checker_for, QuotaChecker};
use std::net::IpAddr;
use std::sync::Arc;

const SECRET: &[u8] = b"test-secret";

struct StubTunnel {
    id: String,
    kind: TransportKind,
    pending: PendingRequests,
}

impl StubTunnel {
    fn new(id: &str, kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            pending: PendingRequests::new(),
        })
    }
}

#[async_trait]
impl TunnelTransport for StubTunnel {
    fn tunnel_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send_request(&self, _request: ForwardRequest) -> Result<(), TransportError> {
        Ok(())
    }

    fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    fn close(&self) {}
}

struct Fixture {
    store: Arc<MemoryStore>,
    registry: Arc<TunnelRegistry>,
    admission: TunnelAdmission,
    quota: Arc<QuotaChecker>,
    jwt: JwtValidator,
}

fn account(id: &str, org: Option<&str>, whitelist: &[&str]) -> Account {
    Account {
        id: id.into(),
        email: format!("{}@example.com", id),
        org_id: org.map(String::from),
        ip_whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
        is_active: true,
        created_at: Utc::now(),
    }
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    store.insert_organization(Organization {
        id: "org-1".into(),
        name: "Acme".into(),
        plan_id: None,
        ip_whitelist: Vec::new(),
        created_at: Utc::now(),
    });
    store.insert_account(account("alice", Some("org-1"), &[]));
    store.insert_application(Application {
        id: "app-1".into(),
        org_id: "org-1".into(),
        name: "Shop".into(),
        subdomain: "shop".into(),
        auth_mode: AuthMode::Inherit,
        rate_limit: None,
        created_at: Utc::now(),
    });

    let registry = Arc::new(TunnelRegistry::new());
    let quota = Arc::new(checker_for(store.clone()));
    let admission = TunnelAdmission::new(
        store.clone(),
        Some(JwtValidator::new(SECRET)),
        registry.clone(),
        quota.clone(),
        AdmissionConfig {
            domain: "tunnels.test".into(),
            scheme: "https".into(),
        },
    );
    Fixture {
        store,
        registry,
        admission,
        quota,
        jwt: JwtValidator::new(SECRET),
    }
}

fn token(jwt: &JwtValidator, account_id: &str) -> Credential {
    let claims = AccountClaims::new(account_id, chrono::Duration::hours(1));
    Credential::AccountToken(jwt.issue(&claims).unwrap())
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_admit_and_release() {
    let fx = fixture();
    let cred = token(&fx.jwt, "alice");
    let tunnel = StubTunnel::new("t1", TransportKind::WebSocket);

    let lease = fx
        .admission
        .admit(Some(&cred), localhost(), &names(&["demo"]), tunnel.clone())
        .await
        .unwrap();

    assert_eq!(fx.admission.public_url("demo"), "https://demo.tunnels.test");
    let route = fx.registry.lookup("demo").unwrap();
    assert_eq!(route.owner.org_id.as_deref(), Some("org-1"));
    assert_eq!(route.owner.account_id.as_deref(), Some("alice"));
    assert_eq!(fx.admission.registry().list_by_org("org-1").len(), 1);

    let record = fx.store.tunnel_record(&record_id("t1", "demo")).unwrap();
    assert_eq!(record.transport, "websocket");
    assert!(record.closed_at.is_none());

    let rx = tunnel.pending.register("in-flight").unwrap();
    lease.close().await;
    lease.close().await;

    assert!(lease.is_released());
    assert!(fx.registry.is_empty());
    assert!(rx.await.is_err());
    assert!(fx
        .store
        .tunnel_record(&record_id("t1", "demo"))
        .unwrap()
        .closed_at
        .is_some());
}

#[tokio::test]
async fn test_second_claim_rejected_across_transports() {
    let fx = fixture();
    let cred = token(&fx.jwt, "alice");

    let _ws = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["demo"]),
            StubTunnel::new("ws", TransportKind::WebSocket),
        )
        .await
        .unwrap();

    let err = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["other", "demo"]),
            StubTunnel::new("tcp", TransportKind::Tcp),
        )
        .await
        .err()
        .unwrap();

    assert!(matches!(err, AdmissionError::Registry(RegistryError::AlreadyInUse(ref s)) if s == "demo"));
    assert_eq!(err.to_string(), "Subdomain already in use: demo");
    // All or nothing
    assert!(!fx.registry.contains("other"));
    assert!(fx.store.tunnel_record(&record_id("tcp", "other")).is_none());
}

#[tokio::test]
async fn test_credential_failures() {
    let fx = fixture();
    let tunnel = || StubTunnel::new("t", TransportKind::WebSocket);

    let err = fx
        .admission
        .admit(None, localhost(), &names(&["demo"]), tunnel())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::MissingCredentials));

    let forged = JwtValidator::new(b"other-secret");
    let err = fx
        .admission
        .admit(Some(&token(&forged, "alice")), localhost(), &names(&["demo"]), tunnel())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);

    let err = fx
        .admission
        .admit(Some(&token(&fx.jwt, "nobody")), localhost(), &names(&["demo"]), tunnel())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::InvalidCredentials(_)));

    let mut disabled = account("bob", Some("org-1"), &[]);
    disabled.is_active = false;
    fx.store.insert_account(disabled);
    let err = fx
        .admission
        .admit(Some(&token(&fx.jwt, "bob")), localhost(), &names(&["demo"]), tunnel())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::AccountDisabled));
    assert!(fx.registry.is_empty());
}

#[tokio::test]
async fn test_ip_whitelist() {
    let fx = fixture();
    fx.store
        .insert_account(account("carol", Some("org-1"), &["10.0.0.0/8"]));
    let cred = token(&fx.jwt, "carol");

    let err = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["demo"]),
            StubTunnel::new("t1", TransportKind::Tcp),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::IpNotAllowed(_)));
    assert_eq!(err.kind(), ErrorKind::AuthorizationDenied);

    fx.admission
        .admit(
            Some(&cred),
            "10.1.2.3".parse().unwrap(),
            &names(&["demo"]),
            StubTunnel::new("t2", TransportKind::Tcp),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_persistent_subdomain_ownership() {
    let fx = fixture();
    fx.store.insert_organization(Organization {
        id: "org-2".into(),
        name: "Other".into(),
        plan_id: None,
        ip_whitelist: Vec::new(),
        created_at: Utc::now(),
    });
    fx.store.insert_account(account("mallory", Some("org-2"), &[]));

    let err = fx
        .admission
        .admit(
            Some(&token(&fx.jwt, "mallory")),
            localhost(),
            &names(&["shop"]),
            StubTunnel::new("t1", TransportKind::WebSocket),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::SubdomainReserved(_)));

    let _lease = fx
        .admission
        .admit(
            Some(&token(&fx.jwt, "alice")),
            localhost(),
            &names(&["shop"]),
            StubTunnel::new("t2", TransportKind::WebSocket),
        )
        .await
        .unwrap();
    assert_eq!(fx.registry.lookup("shop").unwrap().app_id.as_deref(), Some("app-1"));
    assert_eq!(fx.registry.list_by_app("app-1").len(), 1);
}

#[tokio::test]
async fn test_api_key_scope() {
    let fx = fixture();
    let generated = generate_api_key();
    fx.store.insert_api_key(ApiKey {
        id: "key-1".into(),
        name: "deploy".into(),
        account_id: Some("alice".into()),
        org_id: None,
        app_id: Some("app-1".into()),
        display_prefix: generated.display_prefix.clone(),
        key_hash: generated.hash.clone(),
        is_active: true,
        expires_at: None,
        last_used_at: None,
        created_at: Utc::now(),
    });
    let cred = Credential::from_parts(None, Some(generated.plaintext.clone())).unwrap();
    assert!(matches!(cred, Credential::ApiKey(_)));

    let err = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["demo"]),
            StubTunnel::new("t1", TransportKind::WebSocket),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::KeyScope(_)));

    let lease = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["shop"]),
            StubTunnel::new("t2", TransportKind::WebSocket),
        )
        .await
        .unwrap();
    assert_eq!(lease.org_id(), Some("org-1"));

    let unknown = Credential::ApiKey("ghk_not-a-real-key".into());
    let err = fx
        .admission
        .admit(
            Some(&unknown),
            localhost(),
            &names(&["demo"]),
            StubTunnel::new("t3", TransportKind::WebSocket),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::InvalidCredentials(_)));
}

#[tokio::test]
async fn test_concurrent_tunnel_quota() {
    let fx = fixture();
    fx.store.insert_plan(Plan {
        id: "solo".into(),
        name: "Solo".into(),
        limits: PlanLimits {
            concurrent_tunnels: 1,
            ..PlanLimits::unlimited()
        },
        overage_percent: 0,
        grace_period_hours: 0,
    });
    fx.store.insert_organization(Organization {
        id: "org-1".into(),
        name: "Acme".into(),
        plan_id: Some("solo".into()),
        ip_whitelist: Vec::new(),
        created_at: Utc::now(),
    });
    let cred = token(&fx.jwt, "alice");

    let first = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["one"]),
            StubTunnel::new("t1", TransportKind::WebSocket),
        )
        .await
        .unwrap();

    let err = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["two"]),
            StubTunnel::new("t2", TransportKind::WebSocket),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::QuotaExceeded(_)));
    assert!(!fx.registry.contains("two"));

    first.close().await;
    fx.admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["two"]),
            StubTunnel::new("t3", TransportKind::WebSocket),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_claim_returns_tunnel_slot() {
    let fx = fixture();
    let cred = token(&fx.jwt, "alice");
    let usage = fx.quota.usage().clone();

    let _held = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["demo"]),
            StubTunnel::new("t1", TransportKind::WebSocket),
        )
        .await
        .unwrap();
    assert_eq!(usage.concurrent_tunnels("org-1"), 1);

    let err = fx
        .admission
        .admit(
            Some(&cred),
            localhost(),
            &names(&["demo"]),
            StubTunnel::new("t2", TransportKind::Tcp),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AdmissionError::Registry(_)));
    assert_eq!(usage.concurrent_tunnels("org-1"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_admits_respect_concurrency_limit() {
    let fx = fixture();
    fx.store.insert_plan(Plan {
        id: "pair".into(),
        name: "Pair".into(),
        limits: PlanLimits {
            concurrent_tunnels: 2,
            ..PlanLimits::unlimited()
        },
        overage_percent: 0,
        grace_period_hours: 0,
    });
    fx.store.insert_organization(Organization {
        id: "org-1".into(),
        name: "Acme".into(),
        plan_id: Some("pair".into()),
        ip_whitelist: Vec::new(),
        created_at: Utc::now(),
    });
    let cred = token(&fx.jwt, "alice");
    let admission = Arc::new(fx.admission);

    let mut calls = Vec::new();
    for i in 0..12 {
        let admission = admission.clone();
        let cred = cred.clone();
        calls.push(tokio::spawn(async move {
            let subdomain = format!("t{}", i);
            admission
                .admit(
                    Some(&cred),
                    localhost(),
                    &names(&[subdomain.as_str()]),
                    StubTunnel::new(&subdomain, TransportKind::WebSocket),
                )
                .await
        }));
    }

    let mut leases = Vec::new();
    for call in calls {
        match call.await.unwrap() {
            Ok(lease) => leases.push(lease),
            Err(err) => assert!(matches!(err, AdmissionError::QuotaExceeded(_))),
        }
    }
    assert_eq!(leases.len(), 2);
    assert_eq!(fx.registry.len(), 2);
    assert_eq!(fx.quota.usage().concurrent_tunnels("org-1"), 2);
}

#[tokio::test]
async fn test_dropped_lease_fails_waiters() {
    let fx = fixture();
    let tunnel = StubTunnel::new("t1", TransportKind::Tcp);
    let lease = fx
        .admission
        .admit(
            Some(&token(&fx.jwt, "alice")),
            localhost(),
            &names(&["a", "b"]),
            tunnel.clone(),
        )
        .await
        .unwrap();
    assert_eq!(fx.registry.len(), 2);

    let t = tunnel.clone();
    let call = tokio::spawn(async move {
        RequestForwarder::default()
            .forward(t.as_ref(), "GET", "/", WireHeaders::new(), Vec::new())
            .await
    });
    while tunnel.pending.count() == 0 {
        tokio::task::yield_now().await;
    }

    drop(lease);
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ForwardError::TunnelClosed));
    assert!(fx.registry.is_empty());
}
