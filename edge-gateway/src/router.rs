//! The edge router: classify, authorize, tunnel.
//!
//! Every method and path lands in one fallback handler. It resolves the
//! route by longest prefix, runs that route's authorization scheme, and on
//! allow forwards the request through the [`Tunnel`] to the load-balancer
//! listener of the route's pool. One access-log event is emitted per request
//! on the `edge::access` target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::AUTHORIZATION, request, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use edge_auth::bearer::extract_token;
use edge_auth::token::fingerprint;
use edge_auth::{AuthRequest, Authorizer};
use edge_core::{AuthScheme, CoreError, DenyReason, PoolName, Principal, RouteTable, Topology};
use edge_pool::{PoolError, ServiceRegistry};
use indexmap::IndexMap;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::error::GatewayError;
use crate::tunnel::Tunnel;

/// Subject of the bearer token that authorized the request.
pub static PRINCIPAL_HEADER: HeaderName = HeaderName::from_static("x-edge-principal");
/// `cognito:username` of that token, when present.
pub static USERNAME_HEADER: HeaderName = HeaderName::from_static("x-edge-username");
/// Comma-separated `cognito:groups` of that token, when present.
pub static GROUPS_HEADER: HeaderName = HeaderName::from_static("x-edge-groups");

// ── Shared state ─────────────────────────────────────────────────────────────

/// Immutable per-process router state, built once from the [`Topology`].
pub struct EdgeState {
    routes: RouteTable,
    lb_ports: IndexMap<PoolName, u16>,
    bearer: Arc<dyn Authorizer>,
    caller: Arc<dyn Authorizer>,
    registry: Arc<ServiceRegistry>,
    tunnel: Tunnel,
    trusted_caller_header: HeaderName,
    cors_origins: Vec<String>,
}

impl EdgeState {
    /// # Errors
    /// Returns [`GatewayError::Config`] if the trusted caller header is not
    /// a valid header name.
    pub fn new(
        topology: &Topology,
        bearer: Arc<dyn Authorizer>,
        caller: Arc<dyn Authorizer>,
        registry: Arc<ServiceRegistry>,
    ) -> Result<Self, GatewayError> {
        let header = &topology.trusted_caller_header;
        let trusted_caller_header = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
            CoreError::InvalidPolicy { reason: format!("trusted caller header '{header}': {e}") }
        })?;
        Ok(Self {
            routes: topology.routes.clone(),
            lb_ports: topology
                .pools
                .iter()
                .map(|(name, spec)| (name.clone(), spec.lb_port))
                .collect(),
            bearer,
            caller,
            registry,
            tunnel: Tunnel::new(&topology.tunnel),
            trusted_caller_header,
            cors_origins: topology.cors_origins.clone(),
        })
    }

    fn authorizer(&self, scheme: AuthScheme) -> &dyn Authorizer {
        match scheme {
            AuthScheme::BearerToken => self.bearer.as_ref(),
            AuthScheme::CallerIdentity => self.caller.as_ref(),
        }
    }

    async fn dispatch(
        &self,
        mut parts: request::Parts,
        body: Body,
        access: &mut AccessRecord,
    ) -> Result<Response, GatewayError> {
        let path = parts.uri.path().to_owned();
        let Some(route) = self.routes.resolve(&path) else {
            return Err(GatewayError::RouteNotFound(path));
        };
        access.route = Some(route.name.clone());
        access.pool = Some(route.pool.clone());

        // Identity headers are only trusted when this process sets them.
        let verified_caller = parts.headers.remove(&self.trusted_caller_header);
        for name in [&PRINCIPAL_HEADER, &USERNAME_HEADER, &GROUPS_HEADER] {
            parts.headers.remove(name);
        }

        let authorization = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let mut auth = AuthRequest::new(parts.method.as_str(), &path);
        if let Some(value) = authorization {
            auth = auth.with_authorization(value);
        }
        if let Some(value) = verified_caller.as_ref().and_then(|v| v.to_str().ok()) {
            auth = auth.with_verified_caller(value);
        }
        let decision = self.authorizer(route.scheme).authorize(&auth).await;

        access.principal = decision.principal.as_ref().map(|p| p.subject.clone());
        if !decision.allow {
            let reason = decision.reason.unwrap_or(DenyReason::Forbidden);
            access.decision = "deny";
            if route.scheme == AuthScheme::BearerToken {
                access.token = authorization.and_then(extract_token).map(fingerprint);
            }
            return Err(GatewayError::Denied(reason));
        }
        access.decision = "allow";
        if route.scheme == AuthScheme::BearerToken {
            if let Some(principal) = &decision.principal {
                attach_principal(&mut parts.headers, principal);
            }
        }

        let Some(lb_port) = self.lb_ports.get(&route.pool).copied() else {
            return Err(PoolError::UnknownPool(route.pool.clone()).into());
        };
        if self.registry.resolve(&route.pool)?.is_empty() {
            return Err(GatewayError::NoHealthyBackend(route.pool.clone()));
        }

        let backend = self.tunnel.backend(lb_port);
        access.backend = Some(backend.clone());
        let mut target = route.rewrite_path(&path);
        if let Some(query) = parts.uri.query() {
            target.push('?');
            target.push_str(query);
        }
        self.tunnel.forward(&backend, parts, body, &target).await
    }
}

fn attach_principal(headers: &mut HeaderMap, principal: &Principal) {
    let groups = (!principal.groups.is_empty()).then(|| principal.groups.join(","));
    let values = [
        (&PRINCIPAL_HEADER, Some(principal.subject.as_str())),
        (&USERNAME_HEADER, principal.username.as_deref()),
        (&GROUPS_HEADER, groups.as_deref()),
    ];
    for (name, value) in values {
        if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(name.clone(), value);
        }
    }
}

// ── Access log ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct AccessRecord {
    route: Option<String>,
    pool: Option<PoolName>,
    decision: &'static str,
    reason: Option<&'static str>,
    principal: Option<String>,
    token: Option<String>,
    backend: Option<String>,
}

impl AccessRecord {
    fn new() -> Self {
        Self {
            route: None,
            pool: None,
            decision: "no_route",
            reason: None,
            principal: None,
            token: None,
            backend: None,
        }
    }

    fn emit(&self, method: &Method, path: &str, status: StatusCode, latency: Duration) {
        tracing::info!(
            target: "edge::access",
            %method,
            path,
            route = self.route.as_deref().unwrap_or("-"),
            pool = self.pool.as_ref().map_or("-", PoolName::as_str),
            decision = self.decision,
            reason = self.reason.unwrap_or("-"),
            principal = self.principal.as_deref().unwrap_or("-"),
            token = self.token.as_deref().unwrap_or("-"),
            status = status.as_u16(),
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            backend = self.backend.as_deref().unwrap_or("-"),
        );
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the public router. Every path reaches the fallback handler.
pub fn create_router(state: Arc<EdgeState>) -> Router {
    let cors = cors_layer(&state.cors_origins);
    let router = Router::new()
        .fallback(proxy)
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// `None` when no origin is configured (or none parses).
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "ignoring unusable CORS origin");
                None
            }
        })
        .collect();
    (!allowed.is_empty()).then(|| {
        CorsLayer::new()
            .allow_origin(allowed)
            .allow_methods(Any)
            .allow_headers(Any)
    })
}

// ── Handler ──────────────────────────────────────────────────────────────────

async fn proxy(State(edge): State<Arc<EdgeState>>, request: Request) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_owned();

    let mut access = AccessRecord::new();
    let response = match edge.dispatch(parts, body, &mut access).await {
        Ok(response) => response,
        Err(e) => {
            access.reason = Some(e.reason());
            if e.status().is_server_error() {
                tracing::warn!(%method, path, error = %e, "request failed");
            }
            e.into_response()
        }
    };
    access.emit(&method, &path, response.status(), started.elapsed());
    response
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use edge_auth::test_support::{bearer, signature_header, AUDIENCE, ISSUER};
    use edge_core::config::EdgeConfig;
    use edge_core::{AuthorizationDecision, PathRewrite, Route};
    use edge_pool::InstanceHealth;
    use tower::ServiceExt;

    use super::*;

    /// Answers with a fixed decision and remembers what it was asked.
    struct Recording {
        decision: AuthorizationDecision,
        seen: Mutex<Vec<(String, Option<String>, Option<String>)>>,
    }

    impl Recording {
        fn new(decision: AuthorizationDecision) -> Arc<Self> {
            Arc::new(Self { decision, seen: Mutex::new(Vec::new()) })
        }

        fn calls(&self) -> Vec<(String, Option<String>, Option<String>)> {
            match self.seen.lock() {
                Ok(seen) => seen.clone(),
                Err(e) => panic!("recording lock poisoned: {e}"),
            }
        }
    }

    #[async_trait]
    impl Authorizer for Recording {
        async fn authorize(&self, request: &AuthRequest<'_>) -> AuthorizationDecision {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((
                    request.path.to_owned(),
                    request.authorization.map(str::to_owned),
                    request.verified_caller.map(str::to_owned),
                ));
            }
            self.decision.clone()
        }
    }

    fn topology(config: EdgeConfig) -> Topology {
        match Topology::from_config(&config) {
            Ok(t) => t,
            Err(e) => panic!("test topology must validate: {e}"),
        }
    }

    fn config() -> EdgeConfig {
        let mut config = EdgeConfig::default();
        config.identity.issuer = Some(ISSUER.to_owned());
        config.identity.key_set_url = Some("http://127.0.0.1:9/jwks.json".to_owned());
        config.identity.audience = AUDIENCE.to_owned();
        config
    }

    fn app(
        config: EdgeConfig,
        bearer_scheme: &Arc<Recording>,
        caller_scheme: &Arc<Recording>,
        registry: Arc<ServiceRegistry>,
    ) -> Router {
        let bearer_scheme: Arc<dyn Authorizer> = Arc::clone(bearer_scheme) as Arc<dyn Authorizer>;
        let caller_scheme: Arc<dyn Authorizer> = Arc::clone(caller_scheme) as Arc<dyn Authorizer>;
        match EdgeState::new(&topology(config), bearer_scheme, caller_scheme, registry) {
            Ok(state) => create_router(Arc::new(state)),
            Err(e) => panic!("state build failed: {e}"),
        }
    }

    fn empty_registry() -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry::with_pools([PoolName::new("tracking"), PoolName::new("gateway")]))
    }

    fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        match builder.body(Body::empty()) {
            Ok(r) => r,
            Err(e) => panic!("failed to build request: {e}"),
        }
    }

    async fn send(app: Router, req: Request) -> (StatusCode, serde_json::Value) {
        let resp = match app.oneshot(req).await {
            Ok(r) => r,
            Err(e) => panic!("handler error: {e}"),
        };
        let status = resp.status();
        let bytes = match axum::body::to_bytes(resp.into_body(), 64 * 1024).await {
            Ok(b) => b,
            Err(e) => panic!("failed to read body: {e}"),
        };
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn allow() -> AuthorizationDecision {
        AuthorizationDecision::allow(Principal::new("user-1"))
    }

    #[tokio::test]
    async fn api_routes_never_reach_the_bearer_scheme() {
        let bearer_scheme = Recording::new(allow());
        let caller_scheme = Recording::new(AuthorizationDecision::deny(DenyReason::UnknownCaller));
        let app = app(config(), &bearer_scheme, &caller_scheme, empty_registry());

        let token = bearer("valid.jwt.token");
        let uri = "/api/2.0/mlflow/experiments/search";
        let req = request("GET", uri, &[("authorization", &token)]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["reason"], "unknown_caller");
        assert!(bearer_scheme.calls().is_empty(), "bearer scheme must not run on /api");
        assert_eq!(caller_scheme.calls().len(), 1);
    }

    #[tokio::test]
    async fn ui_routes_use_the_bearer_scheme_only() {
        let bearer_scheme = Recording::new(AuthorizationDecision::deny(DenyReason::Expired));
        let caller_scheme = Recording::new(allow());
        let app = app(config(), &bearer_scheme, &caller_scheme, empty_registry());

        let req = request("GET", "/some/ui/path", &[("authorization", "Bearer x.y.z")]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["reason"], "expired");
        assert!(caller_scheme.calls().is_empty());
        assert_eq!(
            bearer_scheme.calls(),
            vec![("/some/ui/path".to_owned(), Some("Bearer x.y.z".to_owned()), None)]
        );
    }

    #[tokio::test]
    async fn trusted_caller_header_reaches_the_caller_scheme() {
        let bearer_scheme = Recording::new(allow());
        let caller_scheme = Recording::new(AuthorizationDecision::deny(DenyReason::Forbidden));
        let app = app(config(), &bearer_scheme, &caller_scheme, empty_registry());

        let arn = "arn:aws:sts::123456789012:assumed-role/mlflow-reader/ci";
        let signature = signature_header("AKIDEXAMPLE");
        let headers = [("authorization", signature.as_str()), ("x-edge-verified-caller", arn)];
        let req = request("DELETE", "/api/2.0/mlflow/runs/delete", &headers);
        let (status, _) = send(app, req).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        let calls = caller_scheme.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2.as_deref(), Some(arn));
    }

    #[tokio::test]
    async fn unmatched_path_is_404_without_authorization() {
        let mut config = config();
        config.routes = vec![Route::new(
            "api",
            "/api",
            "tracking",
            AuthScheme::CallerIdentity,
            PathRewrite::Preserve,
        )];
        let bearer_scheme = Recording::new(allow());
        let caller_scheme = Recording::new(allow());
        let app = app(config, &bearer_scheme, &caller_scheme, empty_registry());

        let req = request("POST", "/ajax-api/2.0/mlflow/runs/search", &[]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["reason"], "no_route");
        assert!(bearer_scheme.calls().is_empty() && caller_scheme.calls().is_empty());
    }

    #[tokio::test]
    async fn allowed_request_to_empty_pool_is_503() {
        let bearer_scheme = Recording::new(allow());
        let caller_scheme = Recording::new(allow());
        let registry = empty_registry();
        let gateway = PoolName::new("gateway");
        let down = registry.register(&gateway, SocketAddr::from(([10, 0, 0, 9], 5001)));
        registry.mark_health(&gateway, down, InstanceHealth::Unhealthy);
        let app = app(config(), &bearer_scheme, &caller_scheme, registry);

        let req = request("GET", "/gateway/endpoints", &[("authorization", "Bearer a.b.c")]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "no_healthy_backend");
    }

    #[tokio::test]
    async fn scheme_sees_the_path_before_rewrite() {
        let bearer_scheme = Recording::new(AuthorizationDecision::deny(DenyReason::MissingToken));
        let caller_scheme = Recording::new(allow());
        let app = app(config(), &bearer_scheme, &caller_scheme, empty_registry());

        let (status, _) = send(app, request("GET", "/gateway/endpoints/chat?x=1", &[])).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(bearer_scheme.calls()[0].0, "/gateway/endpoints/chat");
    }

    #[test]
    fn principal_headers_carry_subject_username_and_groups() {
        let principal = Principal::new("sub-1")
            .with_username("alice")
            .with_groups(vec!["admins".to_owned(), "readers".to_owned()]);
        let mut headers = HeaderMap::new();
        attach_principal(&mut headers, &principal);
        let value = |name: &HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
        assert_eq!(value(&PRINCIPAL_HEADER), Some("sub-1"));
        assert_eq!(value(&USERNAME_HEADER), Some("alice"));
        assert_eq!(value(&GROUPS_HEADER), Some("admins,readers"));
    }

    #[test]
    fn cors_layer_only_with_origins() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["https://studio.example.com".to_owned()]).is_some());
        assert!(cors_layer(&["bad\norigin".to_owned()]).is_none());
    }
}
