//! In-memory key sources and token minting for tests.

#![allow(clippy::missing_panics_doc)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, Jwk, JwkSet, KeyAlgorithm, OctetKeyParameters,
    OctetKeyType,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Map, Value};

use crate::key_set::KeySetSource;
use crate::AuthError;

pub const ISSUER: &str = "https://cognito-idp.eu-west-1.amazonaws.com/eu-west-1_TEST";
pub const AUDIENCE: &str = "test-app-client";

/// Key source serving a swappable in-memory set. Clones share state, so a
/// test can keep one clone to rotate keys or count fetches.
#[derive(Debug, Clone)]
pub struct StaticKeySource {
    keys: Arc<Mutex<Option<JwkSet>>>,
    fetches: Arc<AtomicUsize>,
    delay: Duration,
}

impl StaticKeySource {
    #[must_use]
    pub fn new(keys: JwkSet) -> Self {
        Self {
            keys: Arc::new(Mutex::new(Some(keys))),
            fetches: Arc::default(),
            delay: Duration::ZERO,
        }
    }

    /// Source whose every fetch fails until [`Self::replace`] installs keys.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            keys: Arc::new(Mutex::new(None)),
            fetches: Arc::default(),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every fetch.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }

    /// Swap the served set; `None` makes subsequent fetches fail.
    pub fn replace(&self, keys: Option<JwkSet>) {
        match self.keys.lock() {
            Ok(mut guard) => *guard = keys,
            Err(poisoned) => *poisoned.into_inner() = keys,
        }
    }
}

#[async_trait]
impl KeySetSource for StaticKeySource {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let current = match self.keys.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        current.ok_or_else(|| AuthError::KeySetFetch("identity provider unreachable".into()))
    }
}

/// Symmetric JWK for `secret`, declared as HS256.
#[must_use]
pub fn hs256_jwk(kid: &str, secret: &[u8]) -> Jwk {
    Jwk {
        common: CommonParameters {
            key_id: Some(kid.to_owned()),
            key_algorithm: Some(KeyAlgorithm::HS256),
            ..CommonParameters::default()
        },
        algorithm: AlgorithmParameters::OctetKey(OctetKeyParameters {
            key_type: OctetKeyType::Octet,
            value: URL_SAFE_NO_PAD.encode(secret),
        }),
    }
}

#[must_use]
pub fn hs256_key_set(kid: &str, secret: &[u8]) -> JwkSet {
    JwkSet { keys: vec![hs256_jwk(kid, secret)] }
}

/// Claims builder with identity-provider defaults: issuer and audience match
/// [`ISSUER`] and [`AUDIENCE`], expiry one hour from now.
#[derive(Debug, Clone)]
pub struct TestClaims(Map<String, Value>);

impl TestClaims {
    #[must_use]
    pub fn new(subject: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        let mut claims = Map::new();
        claims.insert("sub".into(), json!(subject));
        claims.insert("iss".into(), json!(ISSUER));
        claims.insert("aud".into(), json!(AUDIENCE));
        claims.insert("token_use".into(), json!("id"));
        claims.insert("iat".into(), json!(now));
        claims.insert("exp".into(), json!(now + 3600));
        Self(claims)
    }

    #[must_use]
    pub fn set(mut self, name: &str, value: Value) -> Self {
        self.0.insert(name.to_owned(), value);
        self
    }

    #[must_use]
    pub fn issued_at(self, at: i64) -> Self {
        self.set("iat", json!(at))
    }

    #[must_use]
    pub fn expires_at(self, at: i64) -> Self {
        self.set("exp", json!(at))
    }

    #[must_use]
    pub fn issuer(self, iss: &str) -> Self {
        self.set("iss", json!(iss))
    }

    #[must_use]
    pub fn audience(self, aud: &str) -> Self {
        self.set("aud", json!(aud))
    }

    /// Shape of an access token: no `aud`, audience carried in `client_id`.
    #[must_use]
    pub fn without_audience(mut self) -> Self {
        self.0.remove("aud");
        self.set("token_use", json!("access"))
    }

    #[must_use]
    pub fn client_id(self, id: &str) -> Self {
        self.set("client_id", json!(id))
    }

    #[must_use]
    pub fn username(self, name: &str) -> Self {
        self.set("cognito:username", json!(name))
    }

    #[must_use]
    pub fn groups(self, groups: &[&str]) -> Self {
        self.set("cognito:groups", json!(groups))
    }
}

fn mint(algorithm: Algorithm, kid: &str, key: &EncodingKey, claims: &TestClaims) -> String {
    let mut header = Header::new(algorithm);
    header.kid = Some(kid.to_owned());
    match jsonwebtoken::encode(&header, &claims.0, key) {
        Ok(token) => token,
        Err(e) => panic!("failed to mint test token: {e}"),
    }
}

/// HS256 token signed with `secret`.
#[must_use]
pub fn mint_hs256(kid: &str, secret: &[u8], claims: &TestClaims) -> String {
    mint(Algorithm::HS256, kid, &EncodingKey::from_secret(secret), claims)
}

/// RS256 token signed with a PEM-encoded RSA private key.
#[must_use]
pub fn mint_rs256(kid: &str, private_pem: &[u8], claims: &TestClaims) -> String {
    let key = match EncodingKey::from_rsa_pem(private_pem) {
        Ok(key) => key,
        Err(e) => panic!("invalid RSA test key: {e}"),
    };
    mint(Algorithm::RS256, kid, &key, claims)
}

/// `Authorization` header value for a bearer token.
#[must_use]
pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

/// A syntactically valid request signature header for `access_key`.
#[must_use]
pub fn signature_header(access_key: &str) -> String {
    format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/20250101/eu-west-1/execute-api/aws4_request, \
         SignedHeaders=host;x-amz-date, Signature={}",
        "0a1b2c3d".repeat(8)
    )
}
