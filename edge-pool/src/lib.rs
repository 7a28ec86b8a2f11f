//! Backend pools behind the edge.
//!
//! - [`ServiceRegistry`]: per-pool membership and health, read as immutable
//!   snapshots, kept current by [`DnsRefresher`] and [`HealthChecker`].
//! - [`PoolBalancer`]: the internal TCP load balancer, one listener per pool.
//! - [`Autoscaler`] and [`AutoscalerLoop`]: one independent scaling state
//!   machine per pool.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod autoscaler;
pub mod balancer;
pub mod capacity;
pub mod dns;
pub mod error;
pub mod health;
pub mod registry;
pub mod scaling_loop;

pub use autoscaler::{Autoscaler, Direction, ScaleDecision, ScalingState};
pub use balancer::PoolBalancer;
pub use capacity::{
    CapacityController, HttpCapacityController, InMemoryCapacity, StatsEndpointSampler,
    UtilizationSource,
};
pub use dns::{resolve_name, DnsRefresher};
pub use error::PoolError;
pub use health::HealthChecker;
pub use registry::{InstanceHealth, MembershipChange, ServiceInstance, ServiceRegistry};
pub use scaling_loop::AutoscalerLoop;
