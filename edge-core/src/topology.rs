//! Validated, immutable topology built once at startup.
//!
//! [`Topology::from_config`] is the only place configuration is interpreted.
//! Router, registry, load balancer and autoscalers all consume the values it
//! returns and never look at the raw [`EdgeConfig`] again.

use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;

use crate::config::{EdgeConfig, HealthConfig, IdentityConfig, PoolConfig, TunnelConfig};
use crate::error::CoreError;
use crate::id::PoolName;
use crate::policy::AccessPolicy;
use crate::route::{normalize_prefix, Route, RouteTable};

/// Autoscaling thresholds and timing for one pool.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct ScalingPolicy {
    /// Percent CPU above which the pool scales out; also the tracking target.
    pub upper_threshold: f64,
    /// Percent CPU below which the pool scales in.
    pub lower_threshold: f64,
    pub sample_interval: Duration,
    /// Consecutive samples that must agree before acting.
    pub evaluation_samples: usize,
    pub cooldown: Duration,
    pub max_step: u32,
}

impl ScalingPolicy {
    #[must_use]
    pub fn new(
        upper_threshold: f64,
        lower_threshold: f64,
        evaluation_samples: usize,
        cooldown: Duration,
    ) -> Self {
        Self {
            upper_threshold,
            lower_threshold,
            sample_interval: Duration::from_secs(60),
            evaluation_samples: evaluation_samples.max(1),
            cooldown,
            max_step: 2,
        }
    }

    #[must_use]
    pub fn with_max_step(mut self, max_step: u32) -> Self {
        self.max_step = max_step.max(1);
        self
    }

    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }
}

/// Health probing cadence for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct HealthPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
}

impl HealthPolicy {
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration, unhealthy_threshold: u32) -> Self {
        Self { interval, timeout, unhealthy_threshold: unhealthy_threshold.max(1) }
    }
}

impl From<HealthConfig> for HealthPolicy {
    fn from(c: HealthConfig) -> Self {
        Self {
            interval: Duration::from_secs(c.interval_secs.max(1)),
            timeout: Duration::from_millis(c.timeout_ms.max(1)),
            unhealthy_threshold: c.unhealthy_threshold.max(1),
        }
    }
}

/// One pool, validated.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolSpec {
    pub name: PoolName,
    pub dns_name: Option<String>,
    pub static_instances: Vec<String>,
    pub lb_port: u16,
    pub stats_path: Option<String>,
    pub orchestrator_url: Option<String>,
    pub min_capacity: u32,
    pub desired_capacity: u32,
    pub max_capacity: u32,
    pub scaling: ScalingPolicy,
    pub health: HealthPolicy,
    pub dns_refresh: Duration,
}

impl PoolSpec {
    /// Pool with static membership, capacity 1/1/1 and default policies.
    #[must_use]
    pub fn new(name: impl Into<PoolName>, lb_port: u16) -> Self {
        Self {
            name: name.into(),
            dns_name: None,
            static_instances: Vec::new(),
            lb_port,
            stats_path: None,
            orchestrator_url: None,
            min_capacity: 1,
            desired_capacity: 1,
            max_capacity: 1,
            scaling: ScalingPolicy::new(70.0, 30.0, 3, Duration::from_secs(60)),
            health: HealthPolicy::from(HealthConfig::default()),
            dns_refresh: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_instances(mut self, instances: Vec<String>) -> Self {
        self.static_instances = instances;
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, min: u32, desired: u32, max: u32) -> Self {
        self.min_capacity = min;
        self.desired_capacity = desired;
        self.max_capacity = max;
        self
    }

    #[must_use]
    pub fn with_scaling(mut self, scaling: ScalingPolicy) -> Self {
        self.scaling = scaling;
        self
    }

    #[must_use]
    pub fn with_health(mut self, health: HealthPolicy) -> Self {
        self.health = health;
        self
    }
}

/// Identity-provider endpoints with derived values filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct IdentitySettings {
    pub key_set_url: String,
    pub issuer: String,
    pub audience: String,
    pub refresh_interval: Duration,
    pub fetch_timeout: Duration,
}

impl IdentitySettings {
    #[must_use]
    pub fn new(
        key_set_url: impl Into<String>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            key_set_url: key_set_url.into(),
            issuer: issuer.into(),
            audience: audience.into(),
            refresh_interval: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Tunnel timeouts, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct TunnelSettings {
    pub lb_host: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl From<&TunnelConfig> for TunnelSettings {
    fn from(c: &TunnelConfig) -> Self {
        Self {
            lb_host: c.lb_host.clone(),
            connect_timeout: Duration::from_millis(c.connect_timeout_ms.max(1)),
            request_timeout: Duration::from_secs(c.request_timeout_secs.max(1)),
        }
    }
}

/// Everything the edge needs, checked for consistency.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Topology {
    pub routes: RouteTable,
    pub pools: IndexMap<PoolName, PoolSpec>,
    pub identity: IdentitySettings,
    pub trusted_caller_header: String,
    /// `(principal glob, policy)` in evaluation order.
    pub caller_policies: Vec<(String, AccessPolicy)>,
    pub group_policies: IndexMap<String, AccessPolicy>,
    pub tunnel: TunnelSettings,
    pub cors_origins: Vec<String>,
}

impl Topology {
    /// Validate `config` and build the topology.
    ///
    /// # Errors
    /// Returns a [`CoreError`] naming the first inconsistent declaration:
    /// a pool with bad capacity bounds, thresholds or duplicate port; a route
    /// with a bad prefix or unknown pool; a malformed policy; or identity
    /// settings that cannot be completed.
    pub fn from_config(config: &EdgeConfig) -> Result<Self, CoreError> {
        let mut pools = IndexMap::new();
        let mut ports = HashSet::new();
        for pool in &config.pools {
            let spec = pool_spec(pool)?;
            if !ports.insert(spec.lb_port) {
                return Err(CoreError::InvalidPool {
                    pool: pool.name.clone(),
                    reason: format!("load-balancer port {} already used", spec.lb_port),
                });
            }
            if pools.insert(spec.name.clone(), spec).is_some() {
                return Err(CoreError::InvalidPool {
                    pool: pool.name.clone(),
                    reason: "declared twice".to_owned(),
                });
            }
        }

        let mut routes = Vec::with_capacity(config.routes.len());
        let mut prefixes = HashSet::new();
        for route in &config.routes {
            if !route.prefix.starts_with('/') {
                return Err(CoreError::InvalidRoute {
                    route: route.name.clone(),
                    reason: format!("prefix '{}' must start with '/'", route.prefix),
                });
            }
            let prefix = normalize_prefix(&route.prefix);
            if !prefixes.insert(prefix.clone()) {
                return Err(CoreError::InvalidRoute {
                    route: route.name.clone(),
                    reason: format!("prefix '{prefix}' declared twice"),
                });
            }
            if !pools.contains_key(&route.pool) {
                return Err(CoreError::UnknownPool {
                    route: route.name.clone(),
                    pool: route.pool.to_string(),
                });
            }
            routes.push(Route::new(
                route.name.clone(),
                &prefix,
                route.pool.clone(),
                route.scheme,
                route.rewrite.clone(),
            ));
        }

        let mut caller_policies = Vec::with_capacity(config.caller_identity.policies.len());
        for entry in &config.caller_identity.policies {
            entry.policy.validate()?;
            caller_policies.push((entry.principal.clone(), entry.policy.clone()));
        }
        for policy in config.group_policies.values() {
            policy.validate()?;
        }

        let trusted_caller_header = config.caller_identity.trusted_header.to_ascii_lowercase();
        if trusted_caller_header.is_empty() {
            return Err(CoreError::InvalidPolicy {
                reason: "trusted caller header is empty".to_owned(),
            });
        }

        Ok(Self {
            routes: RouteTable::new(routes),
            pools,
            identity: identity_settings(&config.identity)?,
            trusted_caller_header,
            caller_policies,
            group_policies: config.group_policies.clone(),
            tunnel: TunnelSettings::from(&config.tunnel),
            cors_origins: config.cors_origins.clone(),
        })
    }

    #[must_use]
    pub fn pool(&self, name: &PoolName) -> Option<&PoolSpec> {
        self.pools.get(name)
    }
}

fn pool_spec(pool: &PoolConfig) -> Result<PoolSpec, CoreError> {
    let invalid = |reason: String| CoreError::InvalidPool { pool: pool.name.clone(), reason };

    if pool.name.is_empty() {
        return Err(invalid("name is empty".to_owned()));
    }
    let cap = pool.capacity;
    if cap.min == 0 || cap.min > cap.desired || cap.desired > cap.max {
        return Err(invalid(format!(
            "capacity must satisfy 0 < min <= desired <= max (got {}/{}/{})",
            cap.min, cap.desired, cap.max
        )));
    }
    let s = pool.scaling;
    let ordered = s.lower_threshold > 0.0
        && s.lower_threshold < s.upper_threshold
        && s.upper_threshold <= 100.0;
    if !ordered {
        return Err(invalid(format!(
            "thresholds must satisfy 0 < lower < upper <= 100 (got {}/{})",
            s.lower_threshold, s.upper_threshold
        )));
    }
    if s.sample_interval_secs == 0 {
        return Err(invalid("sample interval must be positive".to_owned()));
    }
    match (&pool.dns_name, pool.instances.is_empty()) {
        (None, true) => {
            return Err(invalid("needs a dns_name or at least one static instance".to_owned()));
        }
        (Some(_), false) => {
            return Err(invalid("dns_name and static instances are mutually exclusive".to_owned()));
        }
        _ => {}
    }

    let samples =
        usize::try_from(s.evaluation_window_secs / s.sample_interval_secs).unwrap_or(usize::MAX);
    let cooldown = Duration::from_secs(s.cooldown_secs);
    let scaling = ScalingPolicy::new(s.upper_threshold, s.lower_threshold, samples, cooldown)
        .with_max_step(s.max_step)
        .with_sample_interval(Duration::from_secs(s.sample_interval_secs));

    Ok(PoolSpec {
        name: PoolName::new(pool.name.clone()),
        dns_name: pool.dns_name.clone(),
        static_instances: pool.instances.clone(),
        lb_port: pool.lb_port,
        stats_path: pool.stats_path.clone(),
        orchestrator_url: pool.orchestrator_url.clone(),
        min_capacity: cap.min,
        desired_capacity: cap.desired,
        max_capacity: cap.max,
        scaling,
        health: HealthPolicy::from(pool.health),
        dns_refresh: Duration::from_secs(pool.dns_refresh_secs.max(1)),
    })
}

/// Fill in issuer and key-set URL from region + user pool when absent.
fn identity_settings(c: &IdentityConfig) -> Result<IdentitySettings, CoreError> {
    let derived_issuer = match (&c.region, &c.user_pool_id) {
        (Some(region), Some(pool)) => {
            Some(format!("https://cognito-idp.{region}.amazonaws.com/{pool}"))
        }
        _ => None,
    };
    let issuer = c.issuer.clone().or_else(|| derived_issuer.clone()).ok_or_else(|| {
        CoreError::InvalidIdentity { reason: "set issuer, or region and user_pool_id".to_owned() }
    })?;
    let key_set_url = c
        .key_set_url
        .clone()
        .or_else(|| derived_issuer.map(|iss| format!("{iss}/.well-known/jwks.json")))
        .ok_or_else(|| CoreError::InvalidIdentity {
            reason: "set key_set_url, or region and user_pool_id".to_owned(),
        })?;
    if c.audience.is_empty() {
        return Err(CoreError::InvalidIdentity {
            reason: "audience (app client id) is empty".to_owned(),
        });
    }
    Ok(IdentitySettings {
        key_set_url,
        issuer,
        audience: c.audience.clone(),
        refresh_interval: Duration::from_secs(c.refresh_interval_secs),
        fetch_timeout: Duration::from_secs(c.fetch_timeout_secs.max(1)),
    })
}
