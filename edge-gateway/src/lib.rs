//! HTTP edge for the tracking server and the model-serving gateway.
//!
//! [`router::create_router`] serves the public surface: it classifies each
//! request by path prefix, runs the route's authorization scheme and tunnels
//! allowed requests to the internal load balancer of the route's pool.
//! [`admin::create_admin_router`] serves liveness and pool snapshots on a
//! separate listener.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod admin;
pub mod error;
pub mod router;
pub mod tunnel;

pub use error::GatewayError;
