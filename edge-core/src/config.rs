//! Serde model of the edge configuration document.
//!
//! The document is JSON. Every field has a default, so an empty object (or
//! no file at all) yields the standard two-pool topology. A handful of
//! environment variables override the identity-provider and listener
//! settings after the file is read.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::policy::{AccessPolicy, Statement, Verb};
use crate::route::{AuthScheme, PathRewrite, Route};

/// Path prefix of the tracking server's browser-facing JSON API.
pub const AJAX_API_PREFIX: &str = "/ajax-api/2.0/mlflow";

/// Header the request-signing trust boundary sets after verifying a caller.
pub const DEFAULT_TRUSTED_CALLER_HEADER: &str = "x-edge-verified-caller";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct EdgeConfig {
    /// Public listener of the edge router.
    pub listen_addr: String,
    /// Internal listener for liveness and pool snapshots.
    pub admin_addr: String,
    pub identity: IdentityConfig,
    pub caller_identity: CallerIdentityConfig,
    /// Access policy per identity-provider group, consulted in claim order.
    pub group_policies: IndexMap<String, AccessPolicy>,
    pub pools: Vec<PoolConfig>,
    /// Declaration order matters: it breaks ties between equal-length prefixes.
    pub routes: Vec<Route>,
    pub tunnel: TunnelConfig,
    /// Browser origins allowed by CORS. Empty disables the CORS layer.
    pub cors_origins: Vec<String>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_owned(),
            admin_addr: "127.0.0.1:9090".to_owned(),
            identity: IdentityConfig::default(),
            caller_identity: CallerIdentityConfig::default(),
            group_policies: default_group_policies(),
            pools: vec![PoolConfig::tracking(), PoolConfig::gateway()],
            routes: default_routes(),
            tunnel: TunnelConfig::default(),
            cors_origins: Vec::new(),
        }
    }
}

impl EdgeConfig {
    /// Parse a JSON configuration document.
    ///
    /// # Errors
    /// Returns [`CoreError::ConfigLoad`] if the document is not valid JSON
    /// for this model.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|e| CoreError::ConfigLoad(format!("parse: {e}")))
    }

    /// Read and parse the configuration file at `path`.
    ///
    /// # Errors
    /// Returns [`CoreError::ConfigLoad`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::ConfigLoad(format!("read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Load from `EDGE_CONFIG` (or defaults) and apply environment overrides.
    ///
    /// # Errors
    /// Returns [`CoreError::ConfigLoad`] if `EDGE_CONFIG` names an unreadable
    /// or invalid file.
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = match std::env::var("EDGE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `EDGE_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("EDGE_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("EDGE_ADMIN_ADDR") {
            self.admin_addr = v;
        }
        if let Some(v) = lookup("EDGE_KEY_SET_URL") {
            self.identity.key_set_url = Some(v);
        }
        if let Some(v) = lookup("EDGE_ISSUER") {
            self.identity.issuer = Some(v);
        }
        if let Some(v) = lookup("EDGE_AUDIENCE") {
            self.identity.audience = v;
        }
        if let Some(v) = lookup("EDGE_REGION") {
            self.identity.region = Some(v);
        }
        if let Some(v) = lookup("EDGE_USER_POOL_ID") {
            self.identity.user_pool_id = Some(v);
        }
    }
}

/// Identity-provider settings for the bearer-token scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct IdentityConfig {
    /// JWKS document URL. Derived from `region` + `user_pool_id` when absent.
    pub key_set_url: Option<String>,
    /// Expected `iss`. Derived from `region` + `user_pool_id` when absent.
    pub issuer: Option<String>,
    /// Expected `aud` (or `client_id` on access tokens): the app client id.
    pub audience: String,
    pub region: Option<String>,
    pub user_pool_id: Option<String>,
    /// Maximum age of the cached key set before it is refetched lazily.
    pub refresh_interval_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_set_url: None,
            issuer: None,
            audience: String::new(),
            region: None,
            user_pool_id: None,
            refresh_interval_secs: 3600,
            fetch_timeout_secs: 5,
        }
    }
}

/// Settings for the caller-identity scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct CallerIdentityConfig {
    pub trusted_header: String,
    /// Evaluated in order; the first whose `principal` glob matches decides.
    pub policies: Vec<CallerPolicyConfig>,
}

impl Default for CallerIdentityConfig {
    fn default() -> Self {
        Self {
            trusted_header: DEFAULT_TRUSTED_CALLER_HEADER.to_owned(),
            policies: default_caller_policies(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CallerPolicyConfig {
    /// Glob over the verified caller ARN.
    pub principal: String,
    pub policy: AccessPolicy,
}

impl CallerPolicyConfig {
    pub fn new(principal: impl Into<String>, policy: AccessPolicy) -> Self {
        Self { principal: principal.into(), policy }
    }
}

/// One backend pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PoolConfig {
    pub name: String,
    /// `host:port` resolved periodically for membership, e.g.
    /// `mlflowService.http-api.local:5000`.
    #[serde(default)]
    pub dns_name: Option<String>,
    /// Fixed `host:port` members registered at startup.
    #[serde(default)]
    pub instances: Vec<String>,
    /// Internal load-balancer listener port for this pool.
    pub lb_port: u16,
    /// Per-instance stats endpoint sampled by the autoscaler.
    #[serde(default)]
    pub stats_path: Option<String>,
    /// Endpoint that accepts desired-count changes for this pool.
    #[serde(default)]
    pub orchestrator_url: Option<String>,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default = "default_dns_refresh_secs")]
    pub dns_refresh_secs: u64,
}

fn default_dns_refresh_secs() -> u64 {
    30
}

impl PoolConfig {
    /// Minimal pool: name and load-balancer port, defaults elsewhere.
    pub fn new(name: impl Into<String>, lb_port: u16) -> Self {
        Self {
            name: name.into(),
            dns_name: None,
            instances: Vec::new(),
            lb_port,
            stats_path: None,
            orchestrator_url: None,
            capacity: CapacityConfig::default(),
            scaling: ScalingConfig::default(),
            health: HealthConfig::default(),
            dns_refresh_secs: default_dns_refresh_secs(),
        }
    }

    /// Tracking-server pool: two tasks by default, up to six.
    #[must_use]
    pub fn tracking() -> Self {
        let mut pool = Self::new("tracking", 8081);
        pool.dns_name = Some("mlflowService.http-api.local:5000".to_owned());
        pool.stats_path = Some("/stats".to_owned());
        pool.capacity = CapacityConfig { min: 2, desired: 2, max: 6 };
        pool
    }

    /// Model-serving gateway pool.
    #[must_use]
    pub fn gateway() -> Self {
        let mut pool = Self::new("gateway", 8082);
        pool.dns_name = Some("mlflowGateway.http-api.local:5001".to_owned());
        pool.stats_path = Some("/stats".to_owned());
        pool.capacity = CapacityConfig { min: 1, desired: 1, max: 4 };
        pool
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CapacityConfig {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self { min: 1, desired: 1, max: 6 }
    }
}

/// Target-tracking thresholds, in percent CPU.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ScalingConfig {
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub sample_interval_secs: u64,
    /// Utilization must stay past a threshold for this long to act.
    pub evaluation_window_secs: u64,
    pub cooldown_secs: u64,
    /// Largest single scale-out increment.
    pub max_step: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            upper_threshold: 70.0,
            lower_threshold: 30.0,
            sample_interval_secs: 60,
            evaluation_window_secs: 180,
            cooldown_secs: 60,
            max_step: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    /// Consecutive failed checks before an instance is withheld.
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 10, timeout_ms: 2000, unhealthy_threshold: 2 }
    }
}

/// Private-network link from the router to the internal load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct TunnelConfig {
    /// Host the load-balancer listeners are reachable on.
    pub lb_host: String,
    pub connect_timeout_ms: u64,
    /// Upper bound for one proxied exchange, until the response head arrives.
    pub request_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            lb_host: "127.0.0.1".to_owned(),
            connect_timeout_ms: 3000,
            request_timeout_secs: 60,
        }
    }
}

/// `api` (caller identity), `gateway` (bearer, mount stripped), `default` (bearer).
#[must_use]
pub fn default_routes() -> Vec<Route> {
    vec![
        Route::new("api", "/api", "tracking", AuthScheme::CallerIdentity, PathRewrite::Preserve),
        Route::new(
            "gateway",
            "/gateway",
            "gateway",
            AuthScheme::BearerToken,
            PathRewrite::StripPrefix,
        ),
        Route::new("default", "/", "tracking", AuthScheme::BearerToken, PathRewrite::Preserve),
    ]
}

/// `admins`, `readers` and `model-approvers`, in that precedence.
#[must_use]
pub fn default_group_policies() -> IndexMap<String, AccessPolicy> {
    let read_only = || {
        vec![
            Statement::allow(Verb::Post, format!("{AJAX_API_PREFIX}/runs/search")),
            Statement::allow(Verb::Post, format!("{AJAX_API_PREFIX}/experiments/search")),
            Statement::allow(Verb::Get, format!("{AJAX_API_PREFIX}/*")),
            Statement::allow(Verb::Get, "/get-artifact"),
            Statement::allow(Verb::Get, "/model-versions/*"),
        ]
    };

    let mut approver = read_only();
    approver.push(Statement::allow(Verb::Post, format!("{AJAX_API_PREFIX}/registered-models/*")));
    approver.push(Statement::allow(Verb::Any, format!("{AJAX_API_PREFIX}/model-versions/*")));

    let mut policies = IndexMap::new();
    policies.insert("admins".to_owned(), AccessPolicy::allow_all());
    policies.insert("readers".to_owned(), AccessPolicy::new(read_only()));
    policies.insert("model-approvers".to_owned(), AccessPolicy::new(approver));
    policies
}

/// Admin role: everything. Reader role: reads plus searches. Deny-all role: nothing.
#[must_use]
pub fn default_caller_policies() -> Vec<CallerPolicyConfig> {
    vec![
        CallerPolicyConfig::new("arn:aws:*role/*mlflow-deny-all*", AccessPolicy::deny_all()),
        CallerPolicyConfig::new("arn:aws:*role/*mlflow-admin*", AccessPolicy::allow_all()),
        CallerPolicyConfig::new(
            "arn:aws:*role/*mlflow-reader*",
            AccessPolicy::new(vec![
                Statement::allow(Verb::Get, "/*"),
                Statement::allow(Verb::Post, "/api/2.0/mlflow/runs/search"),
                Statement::allow(Verb::Post, "/api/2.0/mlflow/experiments/search"),
            ]),
        ),
    ]
}
