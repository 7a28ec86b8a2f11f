//! Internal admin listener: liveness plus a per-pool snapshot.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use edge_core::PoolName;
use edge_pool::ServiceRegistry;
use indexmap::IndexMap;
use serde::Serialize;

/// What `/healthz` reports for one pool.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub pool: PoolName,
    pub registered: usize,
    pub healthy: usize,
    pub desired_capacity: u32,
}

pub struct AdminState {
    registry: Arc<ServiceRegistry>,
    desired: IndexMap<PoolName, Arc<AtomicU32>>,
}

impl AdminState {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry, desired: IndexMap::new() }
    }

    /// Report `pool`, reading its desired capacity from `desired`.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolName, desired: Arc<AtomicU32>) -> Self {
        self.desired.insert(pool, desired);
        self
    }

    #[must_use]
    pub fn pools(&self) -> Vec<PoolStatus> {
        self.desired
            .iter()
            .map(|(pool, desired)| {
                let members = self.registry.snapshot(pool).unwrap_or_default();
                PoolStatus {
                    pool: pool.clone(),
                    registered: members.len(),
                    healthy: members.iter().filter(|i| i.is_healthy()).count(),
                    desired_capacity: desired.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

/// Build the admin router.
pub fn create_admin_router(state: Arc<AdminState>) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(state)
}

/// `GET /healthz`: always 200 while the process serves; pool health is data.
pub async fn healthz(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok", "pools": state.pools()})))
}
