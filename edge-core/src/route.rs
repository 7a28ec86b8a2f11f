//! Path-prefix routes and the table that classifies inbound paths.

use serde::{Deserialize, Serialize};

use crate::id::PoolName;

/// Which authorization scheme guards a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <jwt>` validated against the identity provider's key set.
    BearerToken,
    /// Request signature verified by the trust boundary in front of the edge.
    CallerIdentity,
}

/// How the matched prefix is rewritten before forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "with")]
pub enum PathRewrite {
    /// Forward the path unchanged.
    #[default]
    Preserve,
    /// Remove the route prefix (`/gateway/x` → `/x`).
    StripPrefix,
    /// Replace the route prefix with another one.
    ReplacePrefix(String),
}

/// A single path-prefix route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Route {
    /// Name used in logs.
    pub name: String,
    /// Normalised prefix: starts with `/`, no trailing `/` unless it is the root.
    pub prefix: String,
    /// Pool the route forwards to.
    pub pool: PoolName,
    /// Scheme evaluated before forwarding.
    pub scheme: AuthScheme,
    #[serde(default)]
    pub rewrite: PathRewrite,
}

impl Route {
    pub fn new(
        name: impl Into<String>,
        prefix: &str,
        pool: impl Into<PoolName>,
        scheme: AuthScheme,
        rewrite: PathRewrite,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: normalize_prefix(prefix),
            pool: pool.into(),
            scheme,
            rewrite,
        }
    }

    /// Segment-aware prefix match: `/api` matches `/api` and `/api/x`, not `/apix`.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Apply the route's rewrite rule to a path this route matched.
    #[must_use]
    pub fn rewrite_path(&self, path: &str) -> String {
        let rest = if self.prefix == "/" {
            path
        } else {
            path.strip_prefix(self.prefix.as_str()).unwrap_or(path)
        };
        match &self.rewrite {
            PathRewrite::Preserve => path.to_owned(),
            PathRewrite::StripPrefix => {
                if rest.is_empty() {
                    "/".to_owned()
                } else {
                    rest.to_owned()
                }
            }
            PathRewrite::ReplacePrefix(replacement) => {
                let base = replacement.trim_end_matches('/');
                if rest.is_empty() || rest == "/" {
                    if base.is_empty() { "/".to_owned() } else { format!("{base}{rest}") }
                } else {
                    let rest = rest.strip_prefix('/').unwrap_or(rest);
                    format!("{base}/{rest}")
                }
            }
        }
    }
}

/// Normalise a configured prefix to the form [`Route::matches`] expects.
#[must_use]
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

/// Static, declaration-ordered set of routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    #[must_use]
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Longest matching prefix; on equal length the earlier declaration wins.
    ///
    /// Returns `None` when nothing matches. There is no implicit catch-all.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        let mut best: Option<&Route> = None;
        for route in &self.routes {
            if !route.matches(path) {
                continue;
            }
            match best {
                Some(b) if b.prefix.len() >= route.prefix.len() => {}
                _ => best = Some(route),
            }
        }
        best
    }

    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
