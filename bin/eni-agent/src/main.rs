use anyhow::Result;
use eni_core::{
    DemandReconciler, DemandSource, EngineMetrics, GarbageCollector, InterfacePool, StaticDemand,
};
use eni_kube::{node_instance_id, PodDemandSource};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod introspect;

use config::AgentConfig;

const NODE_NAME_ENV: &str = "ENI_NODE_NAME";
const LOG_FORMAT_ENV: &str = "ENI_LOG_FORMAT";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting eni-agent...");

    let mut config = AgentConfig::load()?;

    let node_name = std::env::var(NODE_NAME_ENV).ok();
    let kube_client = match &node_name {
        Some(_) => Some(Client::try_default().await?),
        None => None,
    };

    if config.engine.instance_id.is_empty() {
        config.engine.instance_id = match (&kube_client, &node_name) {
            (Some(client), Some(node)) => node_instance_id(client.clone(), node).await?,
            _ => config.simulation.instance_id.clone(),
        };
    }
    config.engine.validate()?;

    // No cloud SDK is wired in; the engine runs against the simulated plane
    let cloud = Arc::new(config.simulation.build_cloud(&config.engine)?);
    info!(
        instance_id = %config.engine.instance_id,
        network_id = %config.simulation.network_id,
        subnets = config.simulation.subnets.len(),
        "simulated control plane initialized"
    );

    let metrics = EngineMetrics::new()?;
    let pool = Arc::new(InterfacePool::from_config(
        cloud,
        config.engine.clone(),
        metrics,
    ));
    pool.bootstrap().await?;

    let demand: Arc<dyn DemandSource> = match (kube_client, node_name) {
        (Some(client), Some(node)) => {
            info!(node = %node, "using pod demand from Kubernetes");
            Arc::new(PodDemandSource::new(client, node))
        }
        _ => {
            warn!("{} not set, using static demand of {}", NODE_NAME_ENV, config.simulation.demand);
            Arc::new(StaticDemand::new(config.simulation.demand))
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = DemandReconciler::new(pool.clone(), demand);
    let reconcile_interval = config.engine.reconcile_interval();
    let reconcile_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { reconciler.run(reconcile_interval, shutdown).await }
    });

    let gc = GarbageCollector::new(pool.clone());
    let gc_interval = config.engine.gc_interval();
    let gc_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { gc.run(gc_interval, shutdown).await }
    });

    let addr: SocketAddr = ([0, 0, 0, 0], config.introspection.port).into();
    let listener = TcpListener::bind(&addr).await?;
    info!("Introspection server listening on {}", addr);
    let server_task = tokio::spawn(introspect::serve(listener, pool.clone(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");

    // Receivers live in the spawned tasks; a send error means they already exited
    let _ = shutdown_tx.send(true);
    let (reconciled, collected, served) = tokio::join!(reconcile_task, gc_task, server_task);
    for joined in [reconciled, collected, served] {
        if let Err(e) = joined {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format == "json");
    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
