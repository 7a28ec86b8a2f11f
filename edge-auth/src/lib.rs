//! Authorization schemes for the tracking-server edge.
//!
//! Two stateless policies guard the routed prefixes:
//!
//! - [`BearerScheme`]: a JWT from the identity provider, verified by
//!   [`TokenValidator`] against a lazily refreshed key set, then checked
//!   against the caller's group access policy.
//! - [`CallerIdentityScheme`]: a request signature verified by the trust
//!   boundary in front of the edge; this layer only checks the signature's
//!   shape and the verified caller's access policy.
//!
//! Neither scheme caches decisions. Every request repeats every check.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod bearer;
pub mod caller;
pub mod error;
pub mod key_set;
pub mod scheme;
pub mod token;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use bearer::BearerScheme;
pub use caller::{CallerIdentityScheme, SignatureHeader};
pub use error::AuthError;
pub use key_set::{HttpKeySetSource, KeySetCache, KeySetSource};
pub use scheme::{AuthRequest, Authorizer};
pub use token::{TokenClaims, TokenValidator};
