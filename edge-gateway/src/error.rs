//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use edge_auth::AuthError;
use edge_core::{CoreError, DenyReason, PoolName};
use edge_pool::PoolError;
use serde_json::json;

/// Everything that can end a request before (or instead of) a backend answer,
/// plus the startup failures of the binary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// No configured route matches the path. There is no catch-all.
    #[error("no route for {0}")]
    RouteNotFound(String),

    /// The route's authorization scheme denied the request.
    #[error("request denied: {0}")]
    Denied(DenyReason),

    /// The target pool has no healthy instance.
    #[error("no healthy backend in pool {0}")]
    NoHealthyBackend(PoolName),

    /// The tunnel could not complete the exchange with the load balancer.
    #[error("tunnel to {backend} failed: {reason}")]
    Tunnel { backend: String, reason: String },

    /// The load balancer did not answer within the request timeout.
    #[error("tunnel to {backend} timed out")]
    TunnelTimeout { backend: String },

    /// The inbound request cannot be turned into a forwarded one.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] CoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Status surfaced to the client.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::Denied(reason) if reason.is_authentication_failure() => StatusCode::UNAUTHORIZED,
            Self::Denied(_) => StatusCode::FORBIDDEN,
            Self::NoHealthyBackend(_) | Self::Pool(PoolError::NoHealthyBackend { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Tunnel { .. } => StatusCode::BAD_GATEWAY,
            Self::TunnelTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::Auth(_) | Self::Pool(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable code for the JSON body and the access log.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::RouteNotFound(_) => "no_route",
            Self::Denied(reason) => reason.as_str(),
            Self::NoHealthyBackend(_) | Self::Pool(PoolError::NoHealthyBackend { .. }) => {
                "no_healthy_backend"
            }
            Self::Tunnel { .. } => "tunnel_error",
            Self::TunnelTimeout { .. } => "tunnel_timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Config(_) | Self::Auth(_) | Self::Pool(_) | Self::Io(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Denials carry no detail beyond the reason code.
        let message = match &self {
            Self::Denied(_) if status == StatusCode::UNAUTHORIZED => "unauthorized".to_owned(),
            Self::Denied(_) => "forbidden".to_owned(),
            Self::Config(_) | Self::Auth(_) | Self::Pool(_) | Self::Io(_) => {
                "internal error".to_owned()
            }
            other => other.to_string(),
        };
        (status, Json(json!({"error": message, "reason": self.reason()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures_map_to_401() {
        let reasons = [DenyReason::Expired, DenyReason::BadSignature, DenyReason::MissingSignature];
        for reason in reasons {
            assert_eq!(GatewayError::Denied(reason).status(), StatusCode::UNAUTHORIZED, "{reason}");
        }
    }

    #[test]
    fn policy_denials_map_to_403() {
        for reason in [DenyReason::Forbidden, DenyReason::UnknownGroup, DenyReason::UnknownCaller] {
            assert_eq!(GatewayError::Denied(reason).status(), StatusCode::FORBIDDEN, "{reason}");
        }
    }

    #[test]
    fn transport_errors_map_to_5xx() {
        let pool = PoolName::new("tracking");
        assert_eq!(
            GatewayError::NoHealthyBackend(pool.clone()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Pool(PoolError::NoHealthyBackend { pool }).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let tunnel = GatewayError::Tunnel {
            backend: "127.0.0.1:8081".to_owned(),
            reason: "reset".to_owned(),
        };
        assert_eq!(tunnel.status(), StatusCode::BAD_GATEWAY);
        let timeout = GatewayError::TunnelTimeout { backend: "127.0.0.1:8081".to_owned() };
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(GatewayError::RouteNotFound("/x".to_owned()).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn denial_body_names_the_reason_only() {
        let resp = GatewayError::Denied(DenyReason::Expired).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let bytes = match axum::body::to_bytes(resp.into_body(), 1024).await {
            Ok(b) => b,
            Err(e) => panic!("failed to read body: {e}"),
        };
        let body: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => panic!("invalid JSON: {e}"),
        };
        assert_eq!(body, json!({"error": "unauthorized", "reason": "expired"}));
    }
}
