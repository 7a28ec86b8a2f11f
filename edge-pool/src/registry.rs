//! Service registry: which instances back each pool, and which are healthy.
//!
//! Membership is stored per pool as an immutable `Arc<[ServiceInstance]>`.
//! Writers build a new slice and swap it under a short write lock; readers
//! clone the `Arc` and never block a writer for longer than that clone.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use edge_core::{InstanceId, PoolName};
use indexmap::IndexMap;
use serde::Serialize;

use crate::PoolError;

/// Result of the last health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    Healthy,
    Unhealthy,
}

/// One backend instance registered under a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub pool: PoolName,
    pub addr: SocketAddr,
    pub health: InstanceHealth,
    pub registered_at: DateTime<Utc>,
}

impl ServiceInstance {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health == InstanceHealth::Healthy
    }
}

/// Addresses added and removed by a membership reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<SocketAddr>,
    pub removed: Vec<SocketAddr>,
}

impl MembershipChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

type Members = Arc<[ServiceInstance]>;

/// Thread-safe registry of pool members.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    pools: RwLock<IndexMap<PoolName, Members>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an empty member list for each of `pools`.
    #[must_use]
    pub fn with_pools<I: IntoIterator<Item = PoolName>>(pools: I) -> Self {
        let map = pools.into_iter().map(|p| (p, Members::from(Vec::new()))).collect();
        Self { pools: RwLock::new(map) }
    }

    /// Pool names in registration order.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    #[must_use]
    pub fn pools(&self) -> Vec<PoolName> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.pools.read().expect("registry read lock poisoned").keys().cloned().collect()
    }

    /// Register `addr` under `pool`, creating the pool if needed. An address
    /// already in the pool keeps its existing id and health.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn register(&self, pool: &PoolName, addr: SocketAddr) -> InstanceId {
        let mut id = InstanceId::new();
        self.update(pool, |members| {
            if let Some(existing) = members.iter().find(|m| m.addr == addr) {
                id = existing.id;
                return false;
            }
            members.push(new_instance(pool, id, addr));
            true
        });
        tracing::debug!(%pool, %addr, instance = %id, "instance registered");
        id
    }

    /// Remove an instance. Returns `true` if it was registered.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn deregister(&self, pool: &PoolName, id: InstanceId) -> bool {
        let removed = self.update(pool, |members| {
            let before = members.len();
            members.retain(|m| m.id != id);
            members.len() != before
        });
        if removed {
            tracing::info!(%pool, instance = %id, "instance deregistered");
        }
        removed
    }

    /// Record a health check outcome. Returns `true` if the state changed.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn mark_health(&self, pool: &PoolName, id: InstanceId, health: InstanceHealth) -> bool {
        self.update(pool, |members| match members.iter_mut().find(|m| m.id == id) {
            Some(m) if m.health != health => {
                m.health = health;
                true
            }
            _ => false,
        })
    }

    /// Healthy instances of `pool` in registration order, each address once.
    ///
    /// # Errors
    /// Returns [`PoolError::UnknownPool`] if the pool was never registered.
    pub fn resolve(&self, pool: &PoolName) -> Result<Vec<ServiceInstance>, PoolError> {
        let members = self.snapshot(pool).ok_or_else(|| PoolError::UnknownPool(pool.clone()))?;
        Ok(members.iter().filter(|m| m.is_healthy()).cloned().collect())
    }

    /// All members of `pool`, healthy or not.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    #[must_use]
    pub fn snapshot(&self, pool: &PoolName) -> Option<Arc<[ServiceInstance]>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let pools = self.pools.read().expect("registry read lock poisoned");
        pools.get(pool).cloned()
    }

    /// Make the pool's membership exactly `addrs`. Kept addresses retain
    /// their id and health; new ones start healthy.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn replace_members(&self, pool: &PoolName, addrs: &[SocketAddr]) -> MembershipChange {
        let mut change = MembershipChange::default();
        self.update(pool, |members| {
            members.retain(|m| {
                let keep = addrs.contains(&m.addr);
                if !keep {
                    change.removed.push(m.addr);
                }
                keep
            });
            for addr in addrs {
                if !members.iter().any(|m| m.addr == *addr) {
                    members.push(new_instance(pool, InstanceId::new(), *addr));
                    change.added.push(*addr);
                }
            }
            !change.is_empty()
        });
        if !change.is_empty() {
            tracing::info!(
                %pool,
                added = ?change.added,
                removed = ?change.removed,
                "pool membership changed"
            );
        }
        change
    }

    /// Copy-on-write edit of one pool. `edit` returns whether it changed anything.
    fn update<F>(&self, pool: &PoolName, edit: F) -> bool
    where
        F: FnOnce(&mut Vec<ServiceInstance>) -> bool,
    {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut pools = self.pools.write().expect("registry write lock poisoned");
        let slot = pools.entry(pool.clone()).or_insert_with(|| Members::from(Vec::new()));
        let mut members = slot.to_vec();
        let changed = edit(&mut members);
        if changed {
            *slot = Members::from(members);
        }
        changed
    }
}

fn new_instance(pool: &PoolName, id: InstanceId, addr: SocketAddr) -> ServiceInstance {
    ServiceInstance {
        id,
        pool: pool.clone(),
        addr,
        health: InstanceHealth::Healthy,
        registered_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn tracking() -> PoolName {
        PoolName::new("tracking")
    }

    fn resolved_addrs(registry: &ServiceRegistry, pool: &PoolName) -> Vec<SocketAddr> {
        match registry.resolve(pool) {
            Ok(instances) => instances.into_iter().map(|i| i.addr).collect(),
            Err(e) => panic!("resolve failed: {e}"),
        }
    }

    #[test]
    fn resolve_returns_registration_order() {
        let registry = ServiceRegistry::new();
        registry.register(&tracking(), addr(3));
        registry.register(&tracking(), addr(1));
        registry.register(&tracking(), addr(2));
        assert_eq!(resolved_addrs(&registry, &tracking()), vec![addr(3), addr(1), addr(2)]);
    }

    #[test]
    fn duplicate_registration_keeps_one_entry() {
        let registry = ServiceRegistry::new();
        let first = registry.register(&tracking(), addr(1));
        let second = registry.register(&tracking(), addr(1));
        assert_eq!(first, second, "same address must keep its id");
        assert_eq!(resolved_addrs(&registry, &tracking()), vec![addr(1)]);
    }

    #[test]
    fn unhealthy_instances_are_never_resolved() {
        let registry = ServiceRegistry::new();
        let a = registry.register(&tracking(), addr(1));
        registry.register(&tracking(), addr(2));
        assert!(registry.mark_health(&tracking(), a, InstanceHealth::Unhealthy));
        let repeated = registry.mark_health(&tracking(), a, InstanceHealth::Unhealthy);
        assert!(!repeated, "no-op must report unchanged");
        assert_eq!(resolved_addrs(&registry, &tracking()), vec![addr(2)]);

        assert!(registry.mark_health(&tracking(), a, InstanceHealth::Healthy));
        assert_eq!(resolved_addrs(&registry, &tracking()), vec![addr(1), addr(2)]);
    }

    #[test]
    fn deregister_removes_instance() {
        let registry = ServiceRegistry::new();
        let a = registry.register(&tracking(), addr(1));
        assert!(registry.deregister(&tracking(), a));
        assert!(!registry.deregister(&tracking(), a));
        assert!(resolved_addrs(&registry, &tracking()).is_empty());
    }

    #[test]
    fn unknown_pool_is_an_error() {
        let registry = ServiceRegistry::new();
        assert!(matches!(registry.resolve(&PoolName::new("nope")), Err(PoolError::UnknownPool(_))));
    }

    #[test]
    fn with_pools_resolves_empty() {
        let registry = ServiceRegistry::with_pools([tracking()]);
        assert!(resolved_addrs(&registry, &tracking()).is_empty());
        assert_eq!(registry.pools(), vec![tracking()]);
    }

    #[test]
    fn pools_are_independent() {
        let registry = ServiceRegistry::new();
        let gateway = PoolName::new("gateway");
        registry.register(&tracking(), addr(1));
        registry.register(&gateway, addr(2));
        assert_eq!(resolved_addrs(&registry, &tracking()), vec![addr(1)]);
        assert_eq!(resolved_addrs(&registry, &gateway), vec![addr(2)]);
    }

    #[test]
    fn replace_members_reconciles_and_keeps_health() {
        let registry = ServiceRegistry::new();
        let kept = registry.register(&tracking(), addr(1));
        registry.register(&tracking(), addr(2));
        registry.mark_health(&tracking(), kept, InstanceHealth::Unhealthy);

        let change = registry.replace_members(&tracking(), &[addr(1), addr(3)]);
        assert_eq!(change.added, vec![addr(3)]);
        assert_eq!(change.removed, vec![addr(2)]);

        let Some(all) = registry.snapshot(&tracking()) else { panic!("pool must exist") };
        let first = &all[0];
        assert_eq!((first.id, first.health), (kept, InstanceHealth::Unhealthy));
        assert_eq!(resolved_addrs(&registry, &tracking()), vec![addr(3)]);
    }

    #[test]
    fn held_snapshot_is_unaffected_by_later_writes() {
        let registry = ServiceRegistry::new();
        registry.register(&tracking(), addr(1));
        let Some(before) = registry.snapshot(&tracking()) else { panic!("pool must exist") };
        registry.register(&tracking(), addr(2));
        assert_eq!(before.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn proptest_resolve_never_repeats_an_address(
            ports in proptest::collection::vec(1u16..20, 0..40),
        ) {
            let registry = ServiceRegistry::new();
            for port in &ports {
                registry.register(&tracking(), addr(*port));
            }
            let resolved = resolved_addrs(&registry, &tracking());
            let mut unique = resolved.clone();
            unique.sort();
            unique.dedup();
            proptest::prop_assert_eq!(resolved.len(), unique.len());
        }
    }
}
