//! JWT validation against the identity provider's key set.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use edge_core::topology::IdentitySettings;
use edge_core::{AuthorizationDecision, DenyReason, Principal};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::key_set::{HttpKeySetSource, KeySetCache, KeySetSource};
use crate::AuthError;

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, expected: &str) -> bool {
        match self {
            Self::One(a) => a == expected,
            Self::Many(all) => all.iter().any(|a| a == expected),
        }
    }
}

/// The claims the edge reads. Unknown claims are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TokenClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub aud: Option<Audience>,
    #[serde(default)]
    pub iss: Option<String>,
    /// Access tokens carry the app client id here instead of `aud`.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default, rename = "cognito:username")]
    pub username: Option<String>,
    #[serde(default, rename = "cognito:groups")]
    pub groups: Vec<String>,
}

impl TokenClaims {
    #[must_use]
    pub fn principal(&self) -> Principal {
        let principal = Principal::new(self.sub.clone()).with_groups(self.groups.clone());
        match &self.username {
            Some(name) => principal.with_username(name.clone()),
            None => principal,
        }
    }

    fn audience_matches(&self, expected: &str) -> bool {
        match &self.aud {
            Some(aud) => aud.contains(expected),
            None => self.client_id.as_deref() == Some(expected),
        }
    }
}

/// Structurally parsed token: header algorithm, key id and claims.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub algorithm: Algorithm,
    pub kid: Option<String>,
    pub claims: TokenClaims,
}

/// Parse the header and claims without checking the signature.
///
/// # Errors
/// Returns [`DenyReason::Malformed`] if the token is not three base64url
/// segments with a JOSE header and a claims object carrying `sub` and `exp`.
pub fn parse(token: &str) -> Result<ParsedToken, DenyReason> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(DenyReason::Malformed);
    };
    let header = jsonwebtoken::decode_header(token).map_err(|_| DenyReason::Malformed)?;
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| DenyReason::Malformed)?;
    let claims: TokenClaims = serde_json::from_slice(&raw).map_err(|_| DenyReason::Malformed)?;
    Ok(ParsedToken { algorithm: header.alg, kid: header.kid, claims })
}

/// Short, non-reversible token identifier for logs.
#[must_use]
pub fn fingerprint(token: &str) -> String {
    Sha256::digest(token.as_bytes()).iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Validates bearer tokens. Every call repeats every check.
pub struct TokenValidator<S: KeySetSource> {
    keys: KeySetCache<S>,
    issuer: String,
    audience: String,
}

impl TokenValidator<HttpKeySetSource> {
    /// Validator backed by the HTTPS key-set endpoint in `settings`.
    ///
    /// # Errors
    /// Returns [`AuthError::KeySetFetch`] if the HTTP client cannot be built.
    pub fn from_settings(settings: &IdentitySettings) -> Result<Self, AuthError> {
        let source = HttpKeySetSource::new(settings.key_set_url.clone(), settings.fetch_timeout)?;
        Ok(Self::new(
            KeySetCache::new(source, settings.refresh_interval),
            settings.issuer.clone(),
            settings.audience.clone(),
        ))
    }
}

impl<S: KeySetSource> TokenValidator<S> {
    #[must_use]
    pub fn new(
        keys: KeySetCache<S>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self { keys, issuer: issuer.into(), audience: audience.into() }
    }

    #[must_use]
    pub fn key_set(&self) -> &KeySetCache<S> {
        &self.keys
    }

    /// Validate `token` at the current wall-clock time.
    pub async fn validate(&self, token: &str) -> AuthorizationDecision {
        self.validate_at(token, chrono::Utc::now().timestamp()).await
    }

    /// Validate `token` as of `now` (seconds since the epoch).
    pub async fn validate_at(&self, token: &str, now: i64) -> AuthorizationDecision {
        match self.verify_at(token, now).await {
            Ok(claims) => AuthorizationDecision::allow(claims.principal()),
            Err(reason) => {
                tracing::debug!(token = %fingerprint(token), %reason, "token rejected");
                AuthorizationDecision::deny(reason)
            }
        }
    }

    /// Run every check and return the verified claims.
    ///
    /// # Errors
    /// Returns the [`DenyReason`] of the first failing check.
    pub async fn verify_at(&self, token: &str, now: i64) -> Result<TokenClaims, DenyReason> {
        let parsed = parse(token)?;
        let Some(kid) = parsed.kid.as_deref() else {
            return Err(DenyReason::UnknownKey);
        };

        let jwk = match self.keys.key(kid).await {
            Ok(Some(jwk)) => jwk,
            Ok(None) => return Err(DenyReason::UnknownKey),
            Err(e) => {
                tracing::warn!(error = %e, kid, "no key set to validate against");
                return Err(DenyReason::KeySetUnavailable);
            }
        };

        if parsed.claims.exp < now {
            return Err(DenyReason::Expired);
        }

        let seen = self.keys.snapshot();
        if let Err(reason) = verify_signature(token, parsed.algorithm, &jwk) {
            if reason != DenyReason::BadSignature {
                return Err(reason);
            }
            // The provider may have rotated material under the same key id.
            let rotated = match self.keys.force_refresh(&seen).await {
                Ok(Some(fresh)) => fresh.find(kid).filter(|k| **k != jwk).cloned(),
                Ok(None) | Err(_) => None,
            };
            match rotated {
                Some(fresh) => verify_signature(token, parsed.algorithm, &fresh)?,
                None => return Err(reason),
            }
        }

        if !parsed.claims.audience_matches(&self.audience) {
            return Err(DenyReason::AudienceMismatch);
        }
        if parsed.claims.iss.as_deref() != Some(self.issuer.as_str()) {
            return Err(DenyReason::IssuerMismatch);
        }
        Ok(parsed.claims)
    }
}

fn same_algorithm<A: Serialize, B: Serialize>(a: &A, b: &B) -> bool {
    matches!((serde_json::to_value(a), serde_json::to_value(b)), (Ok(x), Ok(y)) if x == y)
}

fn verify_signature(token: &str, algorithm: Algorithm, jwk: &Jwk) -> Result<(), DenyReason> {
    if let Some(declared) = &jwk.common.key_algorithm {
        if !same_algorithm(declared, &algorithm) {
            return Err(DenyReason::BadSignature);
        }
    }
    let key = DecodingKey::from_jwk(jwk).map_err(|_| DenyReason::BadSignature)?;

    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<serde_json::Value>(token, &key, &validation) {
        Ok(_) => Ok(()),
        Err(e) => match e.kind() {
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Err(DenyReason::Malformed),
            _ => Err(DenyReason::BadSignature),
        },
    }
}
