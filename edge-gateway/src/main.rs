//! Entry point for the `edge-gateway` binary.
//!
//! Wires one [`Topology`] into every component: the service registry with
//! its DNS refreshers and health checkers, one load-balancer listener and
//! one autoscaler loop per pool, the two authorization schemes, the public
//! router and the admin listener.

use std::future::IntoFuture;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use edge_auth::{BearerScheme, CallerIdentityScheme, TokenValidator};
use edge_core::config::EdgeConfig;
use edge_core::{PoolSpec, Topology};
use edge_gateway::{
    admin::{create_admin_router, AdminState},
    router::{create_router, EdgeState},
    GatewayError,
};
use edge_pool::{
    resolve_name, Autoscaler, AutoscalerLoop, CapacityController, DnsRefresher, HealthChecker,
    HttpCapacityController, InMemoryCapacity, PoolBalancer, ServiceRegistry, StatsEndpointSampler,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Timeout for stats reads and orchestrator calls.
const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "edge-gateway stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), GatewayError> {
    let config = EdgeConfig::from_env()?;
    let topology = Topology::from_config(&config)?;
    info!(
        pools = topology.pools.len(),
        routes = topology.routes.routes().len(),
        issuer = %topology.identity.issuer,
        "topology loaded"
    );

    let registry = Arc::new(ServiceRegistry::with_pools(topology.pools.keys().cloned()));
    let mut admin = AdminState::new(Arc::clone(&registry));
    for spec in topology.pools.values() {
        let desired = start_pool(spec, &topology, &registry).await?;
        admin = admin.with_pool(spec.name.clone(), desired);
    }

    let validator = TokenValidator::from_settings(&topology.identity)?;
    let bearer = Arc::new(BearerScheme::new(validator, topology.group_policies.clone()));
    let caller = Arc::new(CallerIdentityScheme::new(topology.caller_policies.clone()));
    let state = EdgeState::new(&topology, bearer, caller, Arc::clone(&registry))?;

    let public = TcpListener::bind(&config.listen_addr).await?;
    let admin_listener = TcpListener::bind(&config.admin_addr).await?;
    info!(addr = %config.listen_addr, "edge router listening");
    info!(addr = %config.admin_addr, "admin listening");

    let public = axum::serve(public, create_router(Arc::new(state)))
        .with_graceful_shutdown(shutdown_signal());
    let admin = axum::serve(admin_listener, create_admin_router(Arc::new(admin)))
        .with_graceful_shutdown(shutdown_signal());
    tokio::try_join!(public.into_future(), admin.into_future())?;
    info!("edge-gateway shut down");
    Ok(())
}

/// Seed membership, then start the pool's background tasks. Returns the
/// live desired-capacity handle for the admin listener.
async fn start_pool(
    spec: &PoolSpec,
    topology: &Topology,
    registry: &Arc<ServiceRegistry>,
) -> Result<Arc<AtomicU32>, GatewayError> {
    for instance in &spec.static_instances {
        match resolve_name(instance).await {
            Ok(addrs) => {
                for addr in addrs {
                    registry.register(&spec.name, addr);
                }
            }
            Err(e) => tracing::warn!(
                pool = %spec.name,
                %instance,
                error = %e,
                "static instance not resolvable"
            ),
        }
    }
    if let Some(dns_name) = &spec.dns_name {
        let refresher = DnsRefresher::new(
            Arc::clone(registry),
            spec.name.clone(),
            dns_name.clone(),
            spec.dns_refresh,
        );
        if let Err(e) = refresher.refresh_once().await {
            tracing::warn!(pool = %spec.name, error = %e, "initial DNS resolution failed");
        }
        tokio::spawn(refresher.run());
    }
    tokio::spawn(HealthChecker::new(Arc::clone(registry), spec.name.clone(), spec.health).run());

    let listener = TcpListener::bind((topology.tunnel.lb_host.as_str(), spec.lb_port)).await?;
    let balancer = Arc::new(PoolBalancer::new(
        spec.name.clone(),
        Arc::clone(registry),
        topology.tunnel.connect_timeout,
    ));
    tokio::spawn(async move {
        let pool = balancer.pool().clone();
        if let Err(e) = balancer.serve(listener).await {
            tracing::error!(%pool, error = %e, "load balancer stopped");
        }
    });

    let Some(stats_path) = &spec.stats_path else {
        info!(pool = %spec.name, "no stats path, autoscaling disabled");
        return Ok(Arc::new(AtomicU32::new(spec.desired_capacity)));
    };
    let sampler = StatsEndpointSampler::new(stats_path.clone(), CONTROL_PLANE_TIMEOUT)?;
    let controller: Box<dyn CapacityController> = match &spec.orchestrator_url {
        Some(url) => Box::new(HttpCapacityController::new(url.clone(), CONTROL_PLANE_TIMEOUT)?),
        None => Box::new(InMemoryCapacity::new()),
    };
    let scaler = Autoscaler::for_pool(spec);
    let scaling_loop = AutoscalerLoop::new(scaler, Arc::clone(registry), sampler, controller);
    let desired = scaling_loop.desired_handle();
    tokio::spawn(scaling_loop.run(spec.scaling.sample_interval));
    Ok(desired)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
