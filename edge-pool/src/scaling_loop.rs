//! Drives one pool's [`Autoscaler`] on a fixed sampling interval.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use edge_core::PoolName;

use crate::autoscaler::{Autoscaler, ScaleDecision};
use crate::capacity::{CapacityController, UtilizationSource};
use crate::registry::ServiceRegistry;

/// Periodic sample → decide → apply loop for a single pool.
///
/// Every piece of state the loop touches belongs to its own pool, so one
/// loop per pool can run side by side without coordination.
pub struct AutoscalerLoop<U: UtilizationSource, C: CapacityController> {
    scaler: Autoscaler,
    registry: Arc<ServiceRegistry>,
    source: U,
    controller: C,
    desired: Arc<AtomicU32>,
}

impl<U: UtilizationSource, C: CapacityController> AutoscalerLoop<U, C> {
    #[must_use]
    pub fn new(
        scaler: Autoscaler,
        registry: Arc<ServiceRegistry>,
        source: U,
        controller: C,
    ) -> Self {
        let desired = Arc::new(AtomicU32::new(scaler.current()));
        Self { scaler, registry, source, controller, desired }
    }

    /// Live view of the desired capacity, for status reporting.
    #[must_use]
    pub fn desired_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.desired)
    }

    #[must_use]
    pub fn scaler(&self) -> &Autoscaler {
        &self.scaler
    }

    fn pool(&self) -> &PoolName {
        self.scaler.pool()
    }

    /// One evaluation tick. Returns the decision that was applied, if any.
    ///
    /// A pool with no healthy instance is not sampled; its capacity is
    /// re-asserted instead so the orchestrator replaces lost instances.
    /// Sampling and capacity failures are logged; they never propagate.
    pub async fn tick(&mut self, now: Instant) -> Option<ScaleDecision> {
        let instances = match self.registry.resolve(self.pool()) {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(pool = %self.pool(), error = %e, "cannot resolve pool for sampling");
                return None;
            }
        };

        let decision = if instances.is_empty() {
            tracing::debug!(pool = %self.pool(), "no healthy instances to sample");
            self.scaler.observe_empty(now)?
        } else {
            let utilization = match self.source.sample(self.pool(), &instances).await {
                Ok(u) => u,
                Err(e) => {
                    tracing::warn!(pool = %self.pool(), error = %e, "utilization sample failed");
                    return None;
                }
            };
            tracing::debug!(
                pool = %self.pool(),
                utilization,
                state = ?self.scaler.state(),
                "utilization sampled"
            );
            self.scaler.observe(now, utilization)?
        };

        match self.controller.set_desired(self.pool(), decision.to).await {
            Ok(()) => {
                self.scaler.applied(now);
                self.desired.store(decision.to, Ordering::Relaxed);
                tracing::info!(
                    pool = %self.pool(),
                    direction = ?decision.direction,
                    from = decision.from,
                    to = decision.to,
                    healthy = instances.len(),
                    "capacity changed"
                );
                Some(decision)
            }
            Err(e) => {
                self.scaler.failed();
                tracing::error!(
                    pool = %self.pool(),
                    to = decision.to,
                    error = %e,
                    "capacity change failed, retrying next tick"
                );
                None
            }
        }
    }

    /// Tick forever on the pool's sample interval.
    pub async fn run(mut self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick(Instant::now()).await;
        }
    }
}
