mod args;
mod handlers;
mod state;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tracing::info;

use atoll_cluster::{AgentCluster, ClusterApi, SimCluster};
use atoll_meta::{EtcdMetaStore, MemoryMetaStore, MetaStore};
use atoll_provision::{
    EventHub, Orchestrator, OrchestratorConfig, PortAllocator, PortRange, RollbackManager,
};

use crate::args::Args;
use crate::handlers::{
    cancel_deployment, create_company, delete_company, deploy_company, deployment_logs,
    deployment_yaml, get_company, get_deployment, healthz, list_companies,
    list_company_deployments, rollback_company,
};
use crate::state::AppState;
use crate::ws::deployment_logs_ws;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    atoll_common::telemetry::init_tracing("atoll-server");
    let args = Args::parse();

    let store: Arc<dyn MetaStore> = match &args.etcd_endpoint {
        Some(endpoint) => {
            let st = EtcdMetaStore::connect(std::slice::from_ref(endpoint)).await?;
            info!(%endpoint, "connected to etcd");
            Arc::new(st)
        }
        None => {
            info!("no etcd endpoint configured, using in-memory store");
            Arc::new(MemoryMetaStore::new())
        }
    };

    let cluster: Arc<dyn ClusterApi> = match &args.cluster_agent_url {
        Some(url) => {
            info!(%url, "using cluster agent");
            Arc::new(AgentCluster::new(url.clone())?)
        }
        None => {
            info!("no cluster agent configured, using in-process simulator");
            Arc::new(SimCluster::new())
        }
    };

    let events = Arc::new(EventHub::new(store.clone()));
    let ports = PortAllocator::new(
        store.clone(),
        PortRange::new(args.port_range_start, args.port_range_end),
    );
    let orch = Orchestrator::new(
        store.clone(),
        cluster,
        events.clone(),
        ports,
        OrchestratorConfig {
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            readiness_timeout: Duration::from_secs(args.readiness_timeout_secs),
            apply_attempts: args.apply_attempts,
            ..OrchestratorConfig::default()
        },
    );
    let rollback = Arc::new(RollbackManager::new(orch.clone()));

    let st = AppState {
        store,
        orch,
        rollback,
        events,
    };

    let api_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/companies", post(create_company).get(list_companies))
        .route("/companies/:id", get(get_company).delete(delete_company))
        .route("/companies/:id/deploy", post(deploy_company))
        .route("/companies/:id/deployments", get(list_company_deployments))
        .route("/companies/:id/rollback", post(rollback_company))
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/yaml", get(deployment_yaml))
        .route("/deployments/:id/logs", get(deployment_logs))
        .route("/deployments/:id/cancel", post(cancel_deployment));

    let app = Router::new()
        .nest("/api", api_routes)
        .route("/ws/deployments/:id/logs", get(deployment_logs_ws))
        .with_state(st);

    info!(addr = %args.listen_addr, "atoll-server listening");
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
