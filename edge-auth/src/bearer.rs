//! Bearer-token scheme: JWT validation followed by a group access policy.

use async_trait::async_trait;
use edge_core::{AccessPolicy, Action, AuthorizationDecision, DenyReason};
use indexmap::IndexMap;

use crate::key_set::KeySetSource;
use crate::scheme::{AuthRequest, Authorizer};
use crate::token::TokenValidator;

const BEARER: &str = "Bearer";

/// Guards the open and proxy routes.
pub struct BearerScheme<S: KeySetSource> {
    validator: TokenValidator<S>,
    /// Consulted in insertion order; the first group the principal is in decides.
    group_policies: IndexMap<String, AccessPolicy>,
}

impl<S: KeySetSource> BearerScheme<S> {
    #[must_use]
    pub fn new(
        validator: TokenValidator<S>,
        group_policies: IndexMap<String, AccessPolicy>,
    ) -> Self {
        Self { validator, group_policies }
    }

    #[must_use]
    pub fn validator(&self) -> &TokenValidator<S> {
        &self.validator
    }

    fn policy_for<'p>(&'p self, groups: &[String]) -> Option<(&'p str, &'p AccessPolicy)> {
        self.group_policies
            .iter()
            .find(|(group, _)| groups.iter().any(|g| g == *group))
            .map(|(group, policy)| (group.as_str(), policy))
    }
}

/// Strip the `Bearer` scheme if present; a bare token is accepted as-is.
#[must_use]
pub fn extract_token(header: &str) -> Option<&str> {
    let header = header.trim();
    let separated = |rest: &str| rest.chars().next().is_none_or(char::is_whitespace);
    let token = match (header.get(..BEARER.len()), header.get(BEARER.len()..)) {
        (Some(scheme), Some(rest)) if scheme.eq_ignore_ascii_case(BEARER) && separated(rest) => {
            rest.trim_start()
        }
        _ => header,
    };
    (!token.is_empty()).then_some(token)
}

#[async_trait]
impl<S: KeySetSource> Authorizer for BearerScheme<S> {
    async fn authorize(&self, request: &AuthRequest<'_>) -> AuthorizationDecision {
        let Some(token) = request.authorization.and_then(extract_token) else {
            return AuthorizationDecision::deny(DenyReason::MissingToken);
        };

        let decision = self.validator.validate(token).await;
        if !decision.allow {
            return decision;
        }
        let Some(principal) = decision.principal else {
            return AuthorizationDecision::deny(DenyReason::Malformed);
        };

        match self.policy_for(&principal.groups) {
            None => {
                tracing::info!(
                    subject = %principal.subject,
                    groups = ?principal.groups,
                    "no policy for any group"
                );
                AuthorizationDecision::deny_principal(principal, DenyReason::UnknownGroup)
            }
            Some((group, policy)) => {
                if policy.permits(Action::Invoke, request.method, request.path) {
                    AuthorizationDecision::allow(principal)
                } else {
                    tracing::debug!(
                        subject = %principal.subject,
                        group,
                        method = request.method,
                        path = request.path,
                        "group policy denies"
                    );
                    AuthorizationDecision::deny_principal(principal, DenyReason::Forbidden)
                }
            }
        }
    }
}
