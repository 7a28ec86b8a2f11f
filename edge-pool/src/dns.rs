//! DNS-driven pool membership.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edge_core::PoolName;

use crate::registry::{MembershipChange, ServiceRegistry};
use crate::PoolError;

/// Resolve `host:port` to its addresses, deduplicated, in resolver order.
///
/// # Errors
/// Returns [`PoolError::Resolve`] if the lookup fails and
/// [`PoolError::EmptyResolution`] if it yields nothing.
pub async fn resolve_name(name: &str) -> Result<Vec<SocketAddr>, PoolError> {
    let found = tokio::net::lookup_host(name)
        .await
        .map_err(|e| PoolError::Resolve { name: name.to_owned(), reason: e.to_string() })?;
    let mut addrs: Vec<SocketAddr> = Vec::new();
    for addr in found {
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    if addrs.is_empty() {
        return Err(PoolError::EmptyResolution { name: name.to_owned() });
    }
    Ok(addrs)
}

/// Keeps one pool's membership in step with its service-discovery name.
pub struct DnsRefresher {
    registry: Arc<ServiceRegistry>,
    pool: PoolName,
    dns_name: String,
    interval: Duration,
}

impl DnsRefresher {
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        pool: PoolName,
        dns_name: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            dns_name: dns_name.into(),
            interval,
        }
    }

    /// Resolve once and reconcile. A failed lookup leaves membership untouched.
    ///
    /// # Errors
    /// Propagates the lookup error from [`resolve_name`].
    pub async fn refresh_once(&self) -> Result<MembershipChange, PoolError> {
        let addrs = resolve_name(&self.dns_name).await?;
        Ok(self.registry.replace_members(&self.pool, &addrs))
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh_once().await {
                tracing::warn!(
                    pool = %self.pool,
                    name = %self.dns_name,
                    error = %e,
                    "membership refresh failed"
                );
            }
        }
    }
}
