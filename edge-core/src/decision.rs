//! Per-request authorization outcomes.
//!
//! A decision is computed fresh for every request and never stored: the
//! revocation latency of a token or caller policy is exactly one request.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The identity an authorization scheme established for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Principal {
    /// Stable subject identifier (token `sub`, or the verified caller ARN).
    pub subject: String,
    /// Human-readable user name, when the identity provider supplies one.
    pub username: Option<String>,
    /// Group memberships asserted by the identity provider.
    pub groups: Vec<String>,
}

impl Principal {
    /// Principal with only a subject.
    pub fn new(subject: impl Into<String>) -> Self {
        Self { subject: subject.into(), username: None, groups: Vec::new() }
    }

    /// Attach a user name.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Attach group memberships.
    #[must_use]
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }
}

/// Machine-readable reason attached to every denial.
///
/// The client-visible status only separates "who are you" (401) from
/// "you may not" (403); the finer reason goes to the access log and the
/// JSON error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DenyReason {
    /// No `Authorization` header on a bearer-token route.
    MissingToken,
    /// The token is not a structurally valid JWT.
    Malformed,
    /// The token's key id is absent from the key set, even after a refetch.
    UnknownKey,
    /// The key set could not be fetched.
    KeySetUnavailable,
    /// Signature verification failed.
    BadSignature,
    /// The token's `exp` is in the past.
    Expired,
    /// The token was issued for a different audience.
    AudienceMismatch,
    /// The token was issued by a different issuer.
    IssuerMismatch,
    /// None of the principal's groups has an access policy.
    UnknownGroup,
    /// No request signature on a caller-identity route.
    MissingSignature,
    /// The request signature header is not in the expected form.
    MalformedSignature,
    /// The trust boundary did not assert a verified caller.
    UnverifiedCaller,
    /// No caller policy matches the verified caller.
    UnknownCaller,
    /// A policy matched but does not permit this method and path.
    Forbidden,
}

impl DenyReason {
    /// Stable snake-case code used in logs and error bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::Malformed => "malformed",
            Self::UnknownKey => "unknown_key",
            Self::KeySetUnavailable => "key_set_unavailable",
            Self::BadSignature => "bad_signature",
            Self::Expired => "expired",
            Self::AudienceMismatch => "audience_mismatch",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::UnknownGroup => "unknown_group",
            Self::MissingSignature => "missing_signature",
            Self::MalformedSignature => "malformed_signature",
            Self::UnverifiedCaller => "unverified_caller",
            Self::UnknownCaller => "unknown_caller",
            Self::Forbidden => "forbidden",
        }
    }

    /// `true` when the caller failed to prove who it is (surfaced as 401);
    /// `false` when the identity is known but not permitted (403).
    #[must_use]
    pub fn is_authentication_failure(self) -> bool {
        !matches!(self, Self::UnknownGroup | Self::UnknownCaller | Self::Forbidden)
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating one authorization scheme against one request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct AuthorizationDecision {
    pub allow: bool,
    pub principal: Option<Principal>,
    pub reason: Option<DenyReason>,
}

impl AuthorizationDecision {
    #[must_use]
    pub fn allow(principal: Principal) -> Self {
        Self { allow: true, principal: Some(principal), reason: None }
    }

    #[must_use]
    pub fn deny(reason: DenyReason) -> Self {
        Self { allow: false, principal: None, reason: Some(reason) }
    }

    /// Deny with the principal retained for the access log.
    #[must_use]
    pub fn deny_principal(principal: Principal, reason: DenyReason) -> Self {
        Self { allow: false, principal: Some(principal), reason: Some(reason) }
    }
}
