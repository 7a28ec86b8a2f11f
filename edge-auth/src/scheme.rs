//! Scheme abstraction shared by the router.

use async_trait::async_trait;
use edge_core::AuthorizationDecision;

/// The slice of a request an authorization scheme may look at.
///
/// Borrowed from the inbound request; schemes never see the body.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub method: &'a str,
    /// Path as received, before any route rewrite.
    pub path: &'a str,
    /// Raw `Authorization` header value.
    pub authorization: Option<&'a str>,
    /// Value of the trust boundary's verified-caller header.
    pub verified_caller: Option<&'a str>,
}

impl<'a> AuthRequest<'a> {
    #[must_use]
    pub fn new(method: &'a str, path: &'a str) -> Self {
        Self { method, path, authorization: None, verified_caller: None }
    }

    #[must_use]
    pub fn with_authorization(mut self, value: &'a str) -> Self {
        self.authorization = Some(value);
        self
    }

    #[must_use]
    pub fn with_verified_caller(mut self, value: &'a str) -> Self {
        self.verified_caller = Some(value);
        self
    }
}

/// An authorization scheme.
///
/// Implementations must be side-effect free with respect to the decision:
/// identical inputs (and identical key material) yield identical decisions.
///
/// # Cancel Safety
/// Cancel safe. Dropping the future abandons the decision; if it was the
/// one fetching the key set, the next waiter starts a fresh fetch.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Evaluate the scheme against one request.
    async fn authorize(&self, request: &AuthRequest<'_>) -> AuthorizationDecision;
}
