//! End-to-end: router → tunnel → load balancer → in-process backend.
//!
//! The backend echoes what it received as JSON and counts requests, so the
//! tests can check both what was forwarded and whether anything was.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::{Json, Router};
use edge_auth::test_support::{
    bearer, hs256_key_set, mint_hs256, signature_header, StaticKeySource, TestClaims, AUDIENCE,
    ISSUER,
};
use edge_auth::{BearerScheme, CallerIdentityScheme, KeySetCache, TokenValidator};
use edge_core::config::{default_group_policies, EdgeConfig};
use edge_core::{PoolName, Topology};
use edge_gateway::router::{create_router, EdgeState};
use edge_pool::{InstanceHealth, PoolBalancer, ServiceRegistry};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

const KID: &str = "edge-test-key";
const SECRET: &[u8] = b"end-to-end-shared-secret";
const READER_ARN: &str = "arn:aws:sts::123456789012:assumed-role/mlflow-reader/ci-session";

async fn echo(State(hits): State<Arc<AtomicUsize>>, request: Request) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        request.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
    };
    Json(json!({
        "method": request.method().as_str(),
        "path": request.uri().path(),
        "query": request.uri().query(),
        "principal": header("x-edge-principal"),
        "groups": header("x-edge-groups"),
        "verified_caller": header("x-edge-verified-caller"),
    }))
}

async fn start_backend(hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    let app = Router::new().fallback(echo).with_state(hits);
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

async fn start_balancer(pool: &PoolName, registry: &Arc<ServiceRegistry>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind balancer");
    let port = listener.local_addr().expect("balancer addr").port();
    let balancer =
        PoolBalancer::new(pool.clone(), Arc::clone(registry), Duration::from_secs(1));
    let balancer = Arc::new(balancer);
    tokio::spawn(balancer.serve(listener));
    port
}

struct Edge {
    app: Router,
    registry: Arc<ServiceRegistry>,
    hits: Arc<AtomicUsize>,
    backend: SocketAddr,
}

/// Both pools point at one echo backend through their own balancer.
async fn edge() -> Edge {
    let (tracking, gateway) = (PoolName::new("tracking"), PoolName::new("gateway"));
    let registry = Arc::new(ServiceRegistry::with_pools([tracking.clone(), gateway.clone()]));
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = start_backend(Arc::clone(&hits)).await;
    registry.register(&tracking, backend);
    registry.register(&gateway, backend);

    let mut config = EdgeConfig::default();
    config.identity.issuer = Some(ISSUER.to_owned());
    config.identity.key_set_url = Some("http://127.0.0.1:9/jwks.json".to_owned());
    config.identity.audience = AUDIENCE.to_owned();
    config.pools[0].lb_port = start_balancer(&tracking, &registry).await;
    config.pools[1].lb_port = start_balancer(&gateway, &registry).await;
    let topology = Topology::from_config(&config).expect("topology");

    let source = StaticKeySource::new(hs256_key_set(KID, SECRET));
    let keys = KeySetCache::new(source, Duration::from_secs(3600));
    let validator = TokenValidator::new(keys, ISSUER, AUDIENCE);
    let bearer_scheme = Arc::new(BearerScheme::new(validator, default_group_policies()));
    let caller_scheme = Arc::new(CallerIdentityScheme::new(topology.caller_policies.clone()));
    let state = EdgeState::new(&topology, bearer_scheme, caller_scheme, Arc::clone(&registry))
        .expect("edge state");

    Edge { app: create_router(Arc::new(state)), registry, hits, backend }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = axum::http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Body::empty()).expect("request");
    let resp = app.clone().oneshot(req).await.expect("router is infallible");
    let status = resp.status();
    let bytes = resp.into_body().collect().await.expect("body").to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn now() -> i64 {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock after epoch").as_secs();
    i64::try_from(secs).expect("timestamp fits")
}

#[tokio::test]
async fn signed_api_request_passes_through_unchanged() {
    let edge = edge().await;
    let signature = signature_header("AKIDEXAMPLE");
    let (status, body) = send(
        &edge.app,
        "GET",
        "/api/2.0/mlflow/experiments/search?max_results=10",
        &[("authorization", &signature), ("x-edge-verified-caller", READER_ARN)],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/api/2.0/mlflow/experiments/search");
    assert_eq!(body["query"], "max_results=10");
    assert_eq!(body["verified_caller"], Value::Null, "trusted header is consumed by the edge");
    assert_eq!(body["principal"], Value::Null, "caller-identity routes carry no token principal");
    assert_eq!(edge.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_token_is_rejected_before_any_backend_contact() {
    let edge = edge().await;
    let claims = TestClaims::new("user-1").groups(&["admins"]).expires_at(now() - 60);
    let token = mint_hs256(KID, SECRET, &claims);
    let auth = bearer(&token);
    let (status, body) = send(&edge.app, "GET", "/some/ui/path", &[("authorization", &auth)]).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["reason"], "expired");
    assert_eq!(edge.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn valid_token_forwards_principal_and_drops_spoofed_headers() {
    let edge = edge().await;
    let token = mint_hs256(KID, SECRET, &TestClaims::new("user-1").groups(&["admins"]));
    let auth = bearer(&token);
    let headers = [
        ("authorization", auth.as_str()),
        ("x-edge-principal", "someone-else"),
        ("x-edge-groups", "admins"),
    ];
    let uri = "/ajax-api/2.0/mlflow/runs/create";
    let (status, body) = send(&edge.app, "POST", uri, &headers).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["method"], "POST");
    assert_eq!(body["principal"], "user-1");
    assert_eq!(body["groups"], "admins");
}

#[tokio::test]
async fn reader_group_cannot_mutate() {
    let edge = edge().await;
    let token = mint_hs256(KID, SECRET, &TestClaims::new("user-2").groups(&["readers"]));
    let auth = bearer(&token);
    let uri = "/ajax-api/2.0/mlflow/runs/delete";
    let (status, body) = send(&edge.app, "POST", uri, &[("authorization", &auth)]).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "forbidden");
    assert_eq!(edge.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gateway_mount_is_stripped() {
    let edge = edge().await;
    let token = mint_hs256(KID, SECRET, &TestClaims::new("user-1").groups(&["admins"]));
    let auth = bearer(&token);
    let (status, body) =
        send(&edge.app, "GET", "/gateway/endpoints/chat", &[("authorization", &auth)]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/endpoints/chat");
}

#[tokio::test]
async fn pool_without_healthy_instances_fails_fast() {
    let edge = edge().await;
    let tracking = PoolName::new("tracking");
    let ids: Vec<_> = edge
        .registry
        .snapshot(&tracking)
        .expect("tracking snapshot")
        .iter()
        .filter(|i| i.addr == edge.backend)
        .map(|i| i.id)
        .collect();
    for id in ids {
        edge.registry.mark_health(&tracking, id, InstanceHealth::Unhealthy);
    }

    let signature = signature_header("AKIDEXAMPLE");
    let headers = [("authorization", signature.as_str()), ("x-edge-verified-caller", READER_ARN)];
    let (status, body) = tokio::time::timeout(
        Duration::from_secs(5),
        send(&edge.app, "GET", "/api/2.0/mlflow/runs/get", &headers),
    )
    .await
    .expect("no hang on an empty pool");

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason"], "no_healthy_backend");
    assert_eq!(edge.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn requests_rotate_and_skip_an_instance_marked_unhealthy() {
    let edge = edge().await;
    let tracking = PoolName::new("tracking");
    let original = edge
        .registry
        .snapshot(&tracking)
        .expect("tracking snapshot")
        .iter()
        .find(|i| i.addr == edge.backend)
        .map(|i| i.id)
        .expect("echo backend registered");
    edge.registry.mark_health(&tracking, original, InstanceHealth::Unhealthy);

    let (a_hits, b_hits) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let a = edge.registry.register(&tracking, start_backend(Arc::clone(&a_hits)).await);
    edge.registry.register(&tracking, start_backend(Arc::clone(&b_hits)).await);

    let signature = signature_header("AKIDEXAMPLE");
    let headers = [("authorization", signature.as_str()), ("x-edge-verified-caller", READER_ARN)];
    for _ in 0..4 {
        let (status, _) = send(&edge.app, "GET", "/api/2.0/mlflow/runs/get", &headers).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(a_hits.load(Ordering::SeqCst), 2, "round-robin reaches the first instance");
    assert_eq!(b_hits.load(Ordering::SeqCst), 2, "round-robin reaches the second instance");

    edge.registry.mark_health(&tracking, a, InstanceHealth::Unhealthy);
    for _ in 0..4 {
        let (status, _) = send(&edge.app, "GET", "/api/2.0/mlflow/runs/get", &headers).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(a_hits.load(Ordering::SeqCst), 2, "unhealthy instance receives no new requests");
    assert_eq!(b_hits.load(Ordering::SeqCst), 6);
    assert_eq!(edge.hits.load(Ordering::SeqCst), 0);
}
