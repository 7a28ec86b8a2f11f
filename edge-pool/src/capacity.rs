//! Collaborators of the autoscaler loop: where utilization comes from and
//! where capacity changes go.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use edge_core::PoolName;
use serde::{Deserialize, Serialize};

use crate::registry::ServiceInstance;
use crate::PoolError;

/// Average CPU utilization (percent) across a pool's healthy instances.
///
/// # Cancel Safety
/// Cancel safe. A dropped sample has no side effects.
#[async_trait]
pub trait UtilizationSource: Send + Sync {
    /// # Errors
    /// Returns [`PoolError::Sampling`] when no instance produced a sample.
    async fn sample(
        &self,
        pool: &PoolName,
        instances: &[ServiceInstance],
    ) -> Result<f64, PoolError>;
}

/// Applies a new desired instance count to a pool.
///
/// # Cancel Safety
/// Not cancel safe: a dropped call may or may not have reached the
/// orchestrator. The loop never cancels it.
#[async_trait]
pub trait CapacityController: Send + Sync {
    /// # Errors
    /// Returns [`PoolError::Capacity`] if the change was not accepted.
    async fn set_desired(&self, pool: &PoolName, desired: u32) -> Result<(), PoolError>;
}

#[derive(Debug, Deserialize)]
struct StatsReport {
    cpu_utilization: f64,
}

/// Reads `GET http://{instance}{stats_path}` → `{"cpu_utilization": f64}`
/// from every healthy instance and averages the answers.
#[derive(Debug, Clone)]
pub struct StatsEndpointSampler {
    client: reqwest::Client,
    stats_path: String,
}

impl StatsEndpointSampler {
    /// # Errors
    /// Returns [`PoolError::Sampling`] if the HTTP client cannot be built.
    pub fn new(stats_path: impl Into<String>, timeout: Duration) -> Result<Self, PoolError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PoolError::Sampling {
                pool: PoolName::new("*"),
                reason: format!("build client: {e}"),
            })?;
        Ok(Self { client, stats_path: stats_path.into() })
    }

    async fn read_one(&self, instance: &ServiceInstance) -> Result<f64, reqwest::Error> {
        let url = format!("http://{}{}", instance.addr, self.stats_path);
        let report: StatsReport =
            self.client.get(url).send().await?.error_for_status()?.json().await?;
        Ok(report.cpu_utilization)
    }
}

#[async_trait]
impl UtilizationSource for StatsEndpointSampler {
    async fn sample(
        &self,
        pool: &PoolName,
        instances: &[ServiceInstance],
    ) -> Result<f64, PoolError> {
        let mut total = 0.0;
        let mut answered = 0u32;
        for instance in instances {
            match self.read_one(instance).await {
                Ok(u) if u.is_finite() => {
                    total += u;
                    answered += 1;
                }
                Ok(u) => {
                    let addr = instance.addr;
                    tracing::debug!(%pool, %addr, value = u, "discarding non-finite sample");
                }
                Err(e) => {
                    tracing::debug!(%pool, addr = %instance.addr, error = %e, "stats read failed");
                }
            }
        }
        if answered == 0 {
            return Err(PoolError::Sampling {
                pool: pool.clone(),
                reason: format!("none of {} instances answered", instances.len()),
            });
        }
        Ok(total / f64::from(answered))
    }
}

#[derive(Debug, Serialize)]
struct DesiredCount<'a> {
    pool: &'a str,
    desired_count: u32,
}

/// Posts `{"pool": ..., "desired_count": n}` to the pool's orchestrator.
#[derive(Debug, Clone)]
pub struct HttpCapacityController {
    client: reqwest::Client,
    url: String,
}

impl HttpCapacityController {
    /// # Errors
    /// Returns [`PoolError::Capacity`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PoolError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PoolError::Capacity {
                pool: PoolName::new("*"),
                reason: format!("build client for {url}: {e}"),
            })?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl CapacityController for HttpCapacityController {
    async fn set_desired(&self, pool: &PoolName, desired: u32) -> Result<(), PoolError> {
        let body = DesiredCount { pool: pool.as_str(), desired_count: desired };
        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| PoolError::Capacity { pool: pool.clone(), reason: e.to_string() })?;
        Ok(())
    }
}

/// Records desired counts in memory. Used when no orchestrator is configured.
#[derive(Debug, Default)]
pub struct InMemoryCapacity {
    desired: Mutex<HashMap<PoolName, u32>>,
}

impl InMemoryCapacity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last desired count recorded for `pool`.
    ///
    /// # Panics
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn desired(&self, pool: &PoolName) -> Option<u32> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.desired.lock().expect("capacity lock poisoned").get(pool).copied()
    }
}

#[async_trait]
impl CapacityController for InMemoryCapacity {
    async fn set_desired(&self, pool: &PoolName, desired: u32) -> Result<(), PoolError> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.desired.lock().expect("capacity lock poisoned").insert(pool.clone(), desired);
        tracing::info!(%pool, desired, "desired capacity recorded (no orchestrator configured)");
        Ok(())
    }
}

#[async_trait]
impl<T: UtilizationSource + ?Sized> UtilizationSource for Box<T> {
    async fn sample(
        &self,
        pool: &PoolName,
        instances: &[ServiceInstance],
    ) -> Result<f64, PoolError> {
        (**self).sample(pool, instances).await
    }
}

#[async_trait]
impl<T: CapacityController + ?Sized> CapacityController for Box<T> {
    async fn set_desired(&self, pool: &PoolName, desired: u32) -> Result<(), PoolError> {
        (**self).set_desired(pool, desired).await
    }
}
