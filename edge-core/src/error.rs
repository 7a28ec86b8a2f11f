/// Errors produced by the `edge-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A route declaration is unusable.
    #[error("invalid route '{route}': {reason}")]
    InvalidRoute { route: String, reason: String },

    /// A pool declaration is unusable.
    #[error("invalid pool '{pool}': {reason}")]
    InvalidPool { pool: String, reason: String },

    /// A route points at a pool that is not declared.
    #[error("route '{route}' targets unknown pool '{pool}'")]
    UnknownPool { route: String, pool: String },

    /// An access-policy statement could not be parsed.
    #[error("invalid policy statement: {reason}")]
    InvalidPolicy { reason: String },

    /// Identity-provider settings are missing or contradictory.
    #[error("identity provider misconfigured: {reason}")]
    InvalidIdentity { reason: String },

    /// The configuration document could not be read or parsed.
    #[error("config load failed: {0}")]
    ConfigLoad(String),
}
