//! Internal TCP load balancer: one listener per pool, round-robin over the
//! pool's healthy members, bytes spliced without inspection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edge_core::PoolName;
use tokio::net::{TcpListener, TcpStream};

use crate::registry::ServiceRegistry;
use crate::PoolError;

/// Round-robin forwarder for one pool.
///
/// The cursor is shared by every connection to this pool and by nothing
/// else, so pools never influence each other's rotation.
pub struct PoolBalancer {
    pool: PoolName,
    registry: Arc<ServiceRegistry>,
    cursor: AtomicUsize,
    connect_timeout: Duration,
}

impl PoolBalancer {
    #[must_use]
    pub fn new(pool: PoolName, registry: Arc<ServiceRegistry>, connect_timeout: Duration) -> Self {
        Self {
            pool,
            registry,
            cursor: AtomicUsize::new(0),
            connect_timeout,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &PoolName {
        &self.pool
    }

    /// Pick the next healthy backend.
    ///
    /// # Errors
    /// Returns [`PoolError::NoHealthyBackend`] when the healthy set is empty
    /// and [`PoolError::UnknownPool`] when the pool is not registered.
    pub fn next_backend(&self) -> Result<SocketAddr, PoolError> {
        let healthy = self.registry.resolve(&self.pool)?;
        if healthy.is_empty() {
            return Err(PoolError::NoHealthyBackend { pool: self.pool.clone() });
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(healthy[turn % healthy.len()].addr)
    }

    /// Connect to the next backend. No retry on a second instance.
    ///
    /// # Errors
    /// Returns [`PoolError::NoHealthyBackend`], [`PoolError::Connect`] or
    /// [`PoolError::ConnectTimeout`].
    pub async fn connect(&self) -> Result<(SocketAddr, TcpStream), PoolError> {
        let addr = self.next_backend()?;
        tracing::debug!(pool = %self.pool, backend = %addr, "backend selected");
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok((addr, stream)),
            Ok(Err(source)) => Err(PoolError::Connect { addr, source }),
            Err(_) => Err(PoolError::ConnectTimeout { addr }),
        }
    }

    /// Forward one accepted client connection until either side closes.
    ///
    /// On failure the client socket is dropped, which closes it.
    ///
    /// # Errors
    /// Propagates selection and connect errors, and I/O errors from the splice.
    pub async fn forward(&self, mut client: TcpStream) -> Result<(u64, u64), PoolError> {
        let (addr, mut upstream) = self.connect().await?;
        if let Err(e) = upstream.set_nodelay(true) {
            tracing::debug!(pool = %self.pool, backend = %addr, error = %e, "set_nodelay failed");
        }
        let bytes = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        tracing::trace!(
            pool = %self.pool,
            backend = %addr,
            sent = bytes.0,
            received = bytes.1,
            "connection closed"
        );
        Ok(bytes)
    }

    /// Accept connections forever, forwarding each on its own task.
    ///
    /// # Errors
    /// Returns [`PoolError::Io`] if the listener has no local address.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), PoolError> {
        let local = listener.local_addr()?;
        tracing::info!(pool = %self.pool, listen = %local, "load balancer listening");
        loop {
            let (client, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::warn!(pool = %self.pool, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let balancer = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = balancer.forward(client).await {
                    tracing::warn!(pool = %balancer.pool, %peer, error = %e, "connection dropped");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceHealth;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn rotation_visits_every_healthy_member_in_order() {
        let registry = Arc::new(ServiceRegistry::new());
        let pool = PoolName::new("tracking");
        for port in [1, 2, 3] {
            registry.register(&pool, addr(port));
        }
        let balancer = PoolBalancer::new(pool, registry, Duration::from_secs(1));
        let picks: Vec<SocketAddr> = (0..6).filter_map(|_| balancer.next_backend().ok()).collect();
        assert_eq!(picks, vec![addr(1), addr(2), addr(3), addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn unhealthy_members_are_skipped() {
        let registry = Arc::new(ServiceRegistry::new());
        let pool = PoolName::new("tracking");
        let down = registry.register(&pool, addr(1));
        registry.register(&pool, addr(2));
        registry.mark_health(&pool, down, InstanceHealth::Unhealthy);

        let balancer = PoolBalancer::new(pool, registry, Duration::from_secs(1));
        for _ in 0..4 {
            assert_eq!(balancer.next_backend().ok(), Some(addr(2)));
        }
    }

    #[test]
    fn empty_pool_has_no_backend() {
        let pool = PoolName::new("gateway");
        let registry = Arc::new(ServiceRegistry::with_pools([pool.clone()]));
        let balancer = PoolBalancer::new(pool, registry, Duration::from_secs(1));
        assert!(matches!(balancer.next_backend(), Err(PoolError::NoHealthyBackend { .. })));
    }

    #[test]
    fn pools_rotate_independently() {
        let registry = Arc::new(ServiceRegistry::new());
        let (a, b) = (PoolName::new("tracking"), PoolName::new("gateway"));
        for port in [1, 2] {
            registry.register(&a, addr(port));
            registry.register(&b, addr(port + 10));
        }
        let lb_a = PoolBalancer::new(a, Arc::clone(&registry), Duration::from_secs(1));
        let lb_b = PoolBalancer::new(b, registry, Duration::from_secs(1));
        let _ = lb_a.next_backend();
        let _ = lb_a.next_backend();
        let _ = lb_a.next_backend();
        let first = lb_b.next_backend().ok();
        assert_eq!(first, Some(addr(11)), "other pools must not advance this cursor");
    }
}
