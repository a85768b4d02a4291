//! Thin runnable edge for the control plane core: loads configuration,
//! initializes tracing, wires the core's generic services to the in-memory
//! reference repositories, and serves the agent-facing axum router.
//!
//! Mirrors how the teacher framework keeps its library (`acton-service`)
//! separate from a runnable service binary — this file's only job is
//! wiring, not logic.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use forward_control_plane::config::Config;
use forward_control_plane::domain::port_allocator::PortAllocator;
use forward_control_plane::memory::{
    InMemoryAgents, InMemoryChains, InMemoryGroups, InMemoryNodes, InMemoryPlans, InMemoryRules,
    InMemoryStatusCache, InMemorySubscriptions, InMemoryTrafficCache, InMemoryTx, InMemoryUsage,
};
use forward_control_plane::observability::init_tracing;
use forward_control_plane::rest;
use forward_control_plane::services::quota_service::QuotaAggregator;
use forward_control_plane::services::rule_service::RuleCommandService;
use forward_control_plane::services::status_service::StatusAggregator;
use forward_control_plane::session::known_ports::KnownWsPorts;
use forward_control_plane::session::registry::SessionRegistry;
use forward_control_plane::sync::engine::ConfigSyncEngine;
use forward_control_plane::websocket_handler::{ws_upgrade_handler, AppState};
use tokio::net::TcpListener;

type Quota = QuotaAggregator<InMemorySubscriptions, InMemoryPlans, InMemoryRules, InMemoryUsage, InMemoryUsage>;
type State = AppState<
    InMemoryAgents,
    InMemoryRules,
    InMemoryNodes,
    InMemoryGroups,
    InMemoryPlans,
    InMemoryTx,
    Quota,
    InMemoryChains,
    InMemoryStatusCache,
    InMemoryTrafficCache,
>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config)?;

    let agents = InMemoryAgents::default();
    let rules = InMemoryRules::default();
    let nodes = InMemoryNodes::default();
    let groups = InMemoryGroups::default();
    let plans = InMemoryPlans::default();
    let subscriptions = InMemorySubscriptions::default();
    let usage = InMemoryUsage;
    let chains = InMemoryChains::default();
    let tx = InMemoryTx;
    let traffic_cache = Arc::new(InMemoryTrafficCache::default());
    let status_cache = InMemoryStatusCache::default();

    let registry = SessionRegistry::new();
    let sync = ConfigSyncEngine::new(registry.clone());
    let known_ws_ports = KnownWsPorts::new();
    let server_secret = config.secrets.agent_token_secret.clone().into_bytes();

    let quota = QuotaAggregator::new(subscriptions, plans.clone(), rules.clone(), usage, usage);

    let rule_service = Arc::new(RuleCommandService::new(
        agents.clone(),
        rules.clone(),
        nodes,
        groups,
        plans,
        tx,
        quota,
        chains,
        sync.clone(),
        known_ws_ports.clone(),
        PortAllocator::new(config.ports.allocation_attempts),
        server_secret.clone(),
        config.ports.create_retry_attempts,
    ));

    let status = Arc::new(StatusAggregator::new(
        status_cache,
        agents.clone(),
        config.quota.last_seen_rate_limit(),
    ));

    let state: State = AppState {
        agents,
        rules,
        registry,
        sync,
        known_ws_ports,
        rule_service,
        status,
        traffic_cache,
        server_secret: Arc::new(server_secret),
        session_config: Arc::new(config.session.clone()),
    };

    let app: Router = Router::new()
        .route("/ws/forward-agent", get(ws_upgrade_handler::<
            InMemoryAgents, InMemoryRules, InMemoryNodes, InMemoryGroups, InMemoryPlans,
            InMemoryTx, Quota, InMemoryChains, InMemoryStatusCache, InMemoryTrafficCache,
        >))
        .route("/forward-agent-api/rules", get(rest::get_rules::<
            InMemoryAgents, InMemoryRules, InMemoryNodes, InMemoryGroups, InMemoryPlans,
            InMemoryTx, Quota, InMemoryChains, InMemoryStatusCache, InMemoryTrafficCache,
        >))
        .route("/forward-agent-api/traffic", post(rest::post_traffic::<
            InMemoryAgents, InMemoryRules, InMemoryNodes, InMemoryGroups, InMemoryPlans,
            InMemoryTx, Quota, InMemoryChains, InMemoryStatusCache, InMemoryTrafficCache,
        >))
        .route(
            "/forward-agent-api/exit-endpoint/{exit_agent_sid}",
            get(rest::get_exit_endpoint::<
                InMemoryAgents, InMemoryRules, InMemoryNodes, InMemoryGroups, InMemoryPlans,
                InMemoryTx, Quota, InMemoryChains, InMemoryStatusCache, InMemoryTrafficCache,
            >),
        )
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port).parse()?;
    tracing::info!(%addr, "forward control plane listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received sigterm"),
    }
}
