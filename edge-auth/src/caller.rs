//! Caller-identity scheme for the `/api` prefix.
//!
//! The request signature itself is verified by the infrastructure that
//! terminates the request. This layer only insists that a signature of the
//! right shape is present, reads the caller the trust boundary verified,
//! and applies that caller's access policy.

use async_trait::async_trait;
use edge_core::policy::glob_match;
use edge_core::{AccessPolicy, Action, AuthorizationDecision, DenyReason, Principal};

use crate::scheme::{AuthRequest, Authorizer};
use crate::AuthError;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "execute-api";
const TERMINATOR: &str = "aws4_request";

/// Parsed `Authorization` header of a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SignatureHeader {
    pub access_key: String,
    pub date: String,
    pub region: String,
    pub service: String,
    pub signed_headers: Vec<String>,
    pub signature: String,
}

impl SignatureHeader {
    /// Parse `AWS4-HMAC-SHA256 Credential=…, SignedHeaders=…, Signature=…`.
    ///
    /// # Errors
    /// Returns [`AuthError::MalformedSignature`] when any component is
    /// missing or malformed, or when the credential scope names a service
    /// other than `execute-api`.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let malformed = |what: &str| AuthError::MalformedSignature(what.to_owned());

        let rest = value
            .trim()
            .strip_prefix(ALGORITHM)
            .filter(|r| r.starts_with(char::is_whitespace))
            .ok_or_else(|| malformed("unsupported signing algorithm"))?;

        let (mut credential, mut signed_headers, mut signature) = (None, None, None);
        for part in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, val) =
                part.split_once('=').ok_or_else(|| malformed("component without '='"))?;
            let slot = match key.trim() {
                "Credential" => &mut credential,
                "SignedHeaders" => &mut signed_headers,
                "Signature" => &mut signature,
                _ => return Err(malformed("unknown component")),
            };
            if slot.replace(val.trim()).is_some() {
                return Err(malformed("duplicate component"));
            }
        }

        let credential = credential.ok_or_else(|| malformed("missing Credential"))?;
        let signed_headers = signed_headers.ok_or_else(|| malformed("missing SignedHeaders"))?;
        let signature = signature.ok_or_else(|| malformed("missing Signature"))?;

        let scope: Vec<&str> = credential.split('/').collect();
        let [access_key, date, region, service, terminator] = scope.as_slice() else {
            return Err(malformed("credential scope must have five parts"));
        };
        if access_key.is_empty() || region.is_empty() || *terminator != TERMINATOR {
            return Err(malformed("bad credential scope"));
        }
        if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("credential date must be YYYYMMDD"));
        }
        if *service != SERVICE {
            return Err(malformed("credential scope is not for execute-api"));
        }

        let signed_headers: Vec<String> = signed_headers
            .split(';')
            .filter(|h| !h.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        if signed_headers.is_empty() {
            return Err(malformed("no signed headers"));
        }
        if signature.is_empty() || !signature.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed("signature must be hex"));
        }

        Ok(Self {
            access_key: (*access_key).to_owned(),
            date: (*date).to_owned(),
            region: (*region).to_owned(),
            service: (*service).to_owned(),
            signed_headers,
            signature: signature.to_owned(),
        })
    }
}

/// Guards the `/api` prefix. Never consults the token validator.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentityScheme {
    /// `(caller glob, policy)`, first match wins.
    policies: Vec<(String, AccessPolicy)>,
}

impl CallerIdentityScheme {
    #[must_use]
    pub fn new(policies: Vec<(String, AccessPolicy)>) -> Self {
        Self { policies }
    }

    fn policy_for(&self, caller: &str) -> Option<&AccessPolicy> {
        self.policies.iter().find(|(pattern, _)| glob_match(pattern, caller)).map(|(_, p)| p)
    }
}

#[async_trait]
impl Authorizer for CallerIdentityScheme {
    async fn authorize(&self, request: &AuthRequest<'_>) -> AuthorizationDecision {
        let Some(header) = request.authorization else {
            return AuthorizationDecision::deny(DenyReason::MissingSignature);
        };
        let signature = match SignatureHeader::parse(header) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting request signature");
                return AuthorizationDecision::deny(DenyReason::MalformedSignature);
            }
        };
        let Some(caller) = request.verified_caller.map(str::trim).filter(|c| !c.is_empty()) else {
            tracing::warn!(
                access_key = %signature.access_key,
                "signed request without a verified caller"
            );
            return AuthorizationDecision::deny(DenyReason::UnverifiedCaller);
        };

        let principal = Principal::new(caller);
        match self.policy_for(caller) {
            None => AuthorizationDecision::deny_principal(principal, DenyReason::UnknownCaller),
            Some(policy) if policy.permits(Action::Invoke, request.method, request.path) => {
                AuthorizationDecision::allow(principal)
            }
            Some(_) => AuthorizationDecision::deny_principal(principal, DenyReason::Forbidden),
        }
    }
}
