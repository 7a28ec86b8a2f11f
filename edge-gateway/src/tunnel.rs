//! Private HTTP/1 link from the router to the internal load balancer.
//!
//! The tunnel is a plain passthrough: method, headers and body go out as
//! received (minus hop-by-hop headers), and the backend's status, headers
//! and body come back the same way.

use std::error::Error as _;
use std::time::Duration;

use axum::body::Body;
use axum::http::{
    header::{CONNECTION, HOST},
    request, HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, Version,
};
use edge_core::topology::TunnelSettings;
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::error::GatewayError;

/// Connection-scoped headers (RFC 7230 §6.1) never forwarded in either direction.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including every header listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// HTTP/1 client towards the load-balancer listeners.
#[derive(Debug, Clone)]
pub struct Tunnel {
    client: Client<HttpConnector, Body>,
    lb_host: String,
    request_timeout: Duration,
}

impl Tunnel {
    #[must_use]
    pub fn new(settings: &TunnelSettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(settings.connect_timeout));
        connector.set_nodelay(true);
        // One balancer connection per request: the balancer picks its
        // backend per connection.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);
        Self {
            client,
            lb_host: settings.lb_host.clone(),
            request_timeout: settings.request_timeout,
        }
    }

    /// `host:port` of the listener that fronts the pool on `lb_port`.
    #[must_use]
    pub fn backend(&self, lb_port: u16) -> String {
        format!("{}:{lb_port}", self.lb_host)
    }

    /// Send one request to `backend` and hand back its response.
    ///
    /// `path_and_query` replaces the inbound path; `Host` is rewritten to
    /// the backend address.
    ///
    /// # Errors
    /// Returns [`GatewayError::Tunnel`] on any transport failure (including
    /// the load balancer closing the connection without an answer) and
    /// [`GatewayError::TunnelTimeout`] when no response head arrives within
    /// the request timeout.
    pub async fn forward(
        &self,
        backend: &str,
        mut parts: request::Parts,
        body: Body,
        path_and_query: &str,
    ) -> Result<Response<Body>, GatewayError> {
        parts.uri = format!("http://{backend}{path_and_query}")
            .parse::<Uri>()
            .map_err(|e| GatewayError::InvalidRequest(format!("forward uri: {e}")))?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        let host = HeaderValue::from_str(backend)
            .map_err(|e| GatewayError::InvalidRequest(format!("backend host: {e}")))?;
        parts.headers.insert(HOST, host);

        let request = Request::from_parts(parts, body);
        let exchange = tokio::time::timeout(self.request_timeout, self.client.request(request));
        let response: Response<Incoming> = match exchange.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let reason = error_chain(&e);
                return Err(GatewayError::Tunnel { backend: backend.to_owned(), reason });
            }
            Err(_) => return Err(GatewayError::TunnelTimeout { backend: backend.to_owned() }),
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// `client error (Connect): tcp connect error: Connection refused` style text.
fn error_chain(e: &hyper_util::client::legacy::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_core::config::TunnelConfig;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut map = headers(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("content-type", "application/json"),
            ("authorization", "Bearer x"),
        ]);
        strip_hop_by_hop(&mut map);
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("content-type"));
        assert!(map.contains_key("authorization"));
    }

    #[test]
    fn headers_named_by_connection_are_removed() {
        let mut map = headers(&[
            ("connection", "x-trace-hop, X-Other"),
            ("x-trace-hop", "1"),
            ("x-other", "2"),
            ("x-kept", "3"),
        ]);
        strip_hop_by_hop(&mut map);
        assert!(!map.contains_key("x-trace-hop"));
        assert!(!map.contains_key("x-other"));
        assert!(map.contains_key("x-kept"));
    }

    #[test]
    fn backend_address_uses_configured_host() {
        let tunnel = Tunnel::new(&TunnelSettings::from(&TunnelConfig::default()));
        assert_eq!(tunnel.backend(8081), "127.0.0.1:8081");
    }

    #[tokio::test]
    async fn refused_listener_is_a_tunnel_error() {
        let port = {
            let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
                Ok(l) => l,
                Err(e) => panic!("bind failed: {e}"),
            };
            match listener.local_addr() {
                Ok(a) => a.port(),
                Err(e) => panic!("local addr failed: {e}"),
            }
        };
        let tunnel = Tunnel::new(&TunnelSettings::from(&TunnelConfig::default()));
        let (parts, body) = Request::new(Body::empty()).into_parts();
        let result = tunnel.forward(&tunnel.backend(port), parts, body, "/health").await;
        assert!(matches!(result, Err(GatewayError::Tunnel { .. })), "got {result:?}");
    }
}
