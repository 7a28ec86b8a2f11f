//! Core value types for the tracking-server edge.
//!
//! Everything here is pure data: pools, routes, authorization schemes and
//! decisions, access policies, and the validated [`topology::Topology`]
//! built once from [`config::EdgeConfig`] at startup. No I/O happens in
//! this crate.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod decision;
pub mod error;
pub mod id;
pub mod policy;
pub mod route;
pub mod topology;

pub use decision::{AuthorizationDecision, DenyReason, Principal};
pub use error::CoreError;
pub use id::{InstanceId, PoolName};
pub use policy::{AccessPolicy, Action, Effect, Statement, Verb};
pub use route::{AuthScheme, PathRewrite, Route, RouteTable};
pub use topology::{PoolSpec, ScalingPolicy, Topology};
