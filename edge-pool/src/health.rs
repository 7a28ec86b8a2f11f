//! Periodic TCP health checks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use edge_core::topology::HealthPolicy;
use edge_core::{InstanceId, PoolName};
use tokio::net::TcpStream;

use crate::registry::{InstanceHealth, ServiceRegistry};

/// Checks every member of one pool and records the outcome in the registry.
///
/// An instance turns unhealthy after `unhealthy_threshold` consecutive
/// failed checks and healthy again after a single success.
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    pool: PoolName,
    policy: HealthPolicy,
    failures: HashMap<InstanceId, u32>,
}

impl HealthChecker {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, pool: PoolName, policy: HealthPolicy) -> Self {
        Self { registry, pool, policy, failures: HashMap::new() }
    }

    /// Check every current member once. Returns the number of healthy members.
    pub async fn check_once(&mut self) -> usize {
        let Some(members) = self.registry.snapshot(&self.pool) else {
            return 0;
        };

        let checks = members.iter().map(|m| {
            let (id, addr) = (m.id, m.addr);
            let timeout = self.policy.timeout;
            async move { (id, addr, connect_check(addr, timeout).await) }
        });
        let outcomes = join_all(checks).await;

        self.failures.retain(|id, _| members.iter().any(|m| m.id == *id));
        for (id, addr, ok) in outcomes {
            let health = if ok {
                self.failures.remove(&id);
                InstanceHealth::Healthy
            } else {
                let count = self.failures.entry(id).or_insert(0);
                *count += 1;
                if *count < self.policy.unhealthy_threshold {
                    tracing::debug!(pool = %self.pool, %addr, failures = *count, "check failed");
                    continue;
                }
                InstanceHealth::Unhealthy
            };
            if self.registry.mark_health(&self.pool, id, health) {
                tracing::info!(pool = %self.pool, %addr, ?health, "instance health changed");
            }
        }
        self.registry.resolve(&self.pool).map_or(0, |healthy| healthy.len())
    }

    /// Check forever on the policy interval.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let healthy = self.check_once().await;
            tracing::trace!(pool = %self.pool, healthy, "health check round complete");
        }
    }
}

async fn connect_check(addr: SocketAddr, timeout: std::time::Duration) -> bool {
    matches!(tokio::time::timeout(timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Run all checks of a round concurrently.
async fn join_all<F, T>(futures: impl Iterator<Item = F>) -> Vec<T>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut set = tokio::task::JoinSet::new();
    for fut in futures {
        set.spawn(fut);
    }
    let mut out = Vec::new();
    while let Some(res) = set.join_next().await {
        match res {
            Ok(v) => out.push(v),
            Err(e) => tracing::warn!(error = %e, "health check task failed"),
        }
    }
    out
}
