//! Error types for the auth crate.

/// Failures that prevent a decision from being computed normally.
///
/// These never reach the client directly: the schemes fold them into a
/// deny decision with the matching reason code.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The key set could not be retrieved from the identity provider.
    #[error("key set fetch failed: {0}")]
    KeySetFetch(String),

    /// The key set document was retrieved but is not a valid JWKS.
    #[error("key set decode failed: {0}")]
    KeySetDecode(String),

    /// The `Authorization` header is not a request signature.
    #[error("malformed request signature: {0}")]
    MalformedSignature(String),
}
