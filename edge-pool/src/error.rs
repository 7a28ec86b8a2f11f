//! Error types for the pool crate.

use std::net::SocketAddr;

use edge_core::PoolName;

/// Failures in membership, forwarding and scaling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool has no instance that passed its last health check.
    #[error("no healthy backend in pool {pool}")]
    NoHealthyBackend { pool: PoolName },

    /// The pool was never registered.
    #[error("unknown pool {0}")]
    UnknownPool(PoolName),

    /// The chosen backend refused or dropped the connection attempt.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The chosen backend did not accept within the connect timeout.
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: SocketAddr },

    /// A DNS lookup failed.
    #[error("resolving {name} failed: {reason}")]
    Resolve { name: String, reason: String },

    /// A DNS lookup succeeded but returned no addresses.
    #[error("{name} resolved to no addresses")]
    EmptyResolution { name: String },

    /// Utilization could not be sampled from any instance.
    #[error("sampling utilization for {pool} failed: {reason}")]
    Sampling { pool: PoolName, reason: String },

    /// The orchestrator rejected or did not receive a capacity change.
    #[error("capacity change for {pool} failed: {reason}")]
    Capacity { pool: PoolName, reason: String },

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
