//! The axum WebSocket entrypoint that accepts agent connections (§6.2, C5).
//!
//! One task pair per session: a reader that decodes frames and dispatches by
//! envelope `type`, and a writer that owns the socket and drains the
//! session's bounded send queue. Never write to the socket from the reader
//! side directly — that's the one discipline this module exists to enforce.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::domain::agent::Agent;
use crate::domain::rule::TunnelType;
use crate::ids::token::AgentToken;
use crate::repository::{AgentRepository, AgentStatusCache, ChainRepository, NodeRepository, PlanRepository, ResourceGroupRepository, RuleRepository, RuleStatusCache, TransactionManager};
use crate::services::quota_service::RuleQuotaCheck;
use crate::services::rule_service::RuleCommandService;
use crate::services::status_service::StatusAggregator;
use crate::session::auth;
use crate::session::connection::{AgentSession, OutboundMessage};
use crate::session::envelope::{ConfigAck, Envelope, MessageType, StatusReport};
use crate::session::known_ports::KnownWsPorts;
use crate::session::registry::SessionRegistry;
use crate::sync::engine::ConfigSyncEngine;
use crate::sync::projection::ProjectionContext;

/// Shared application state, threaded through axum via [`axum::extract::State`].
/// Every collaborator is cheap to clone (an `Arc`-backed handle or a DB pool
/// wrapper), matching the session layer's own clone-as-share convention.
pub struct AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT> {
    pub agents: AG,
    pub rules: RU,
    pub registry: SessionRegistry,
    pub sync: ConfigSyncEngine,
    pub known_ws_ports: KnownWsPorts,
    pub rule_service: Arc<RuleCommandService<AG, RU, ND, RG, PL, TX, QA, CH>>,
    pub status: Arc<StatusAggregator<C, AG>>,
    pub traffic_cache: Arc<FT>,
    pub server_secret: Arc<Vec<u8>>,
    pub session_config: Arc<SessionConfig>,
}

impl<AG, RU, ND, RG, PL, TX, QA, CH, C, FT> Clone for AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>
where
    AG: Clone,
    RU: Clone,
{
    fn clone(&self) -> Self {
        Self {
            agents: self.agents.clone(),
            rules: self.rules.clone(),
            registry: self.registry.clone(),
            sync: self.sync.clone(),
            known_ws_ports: self.known_ws_ports.clone(),
            rule_service: self.rule_service.clone(),
            status: self.status.clone(),
            traffic_cache: self.traffic_cache.clone(),
            server_secret: self.server_secret.clone(),
            session_config: self.session_config.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

/// `GET /ws/forward-agent?token=fwd_<shortID>_<mac>` (§6.2).
pub async fn ws_upgrade_handler<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>>,
    Query(query): Query<WsQuery>,
) -> axum::response::Response
where
    AG: AgentRepository + Clone + Send + Sync + 'static,
    RU: RuleRepository + Clone + Send + Sync + 'static,
    ND: NodeRepository + Send + Sync + 'static,
    RG: ResourceGroupRepository + Send + Sync + 'static,
    PL: PlanRepository + Send + Sync + 'static,
    TX: TransactionManager + Send + Sync + 'static,
    QA: RuleQuotaCheck + Send + Sync + 'static,
    CH: ChainRepository + Send + Sync + 'static,
    C: AgentStatusCache + RuleStatusCache + Send + Sync + 'static,
    FT: crate::repository::ForwardTrafficCache + Send + Sync + 'static,
{
    let agent = match auth::authenticate(&query.token, &state.server_secret, &state.agents).await {
        Ok(agent) => agent,
        Err(e) => return crate::rest::error_response(e),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, agent))
}

async fn handle_socket<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(socket: WebSocket, state: AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>, agent: Agent)
where
    AG: AgentRepository + Clone + Send + Sync + 'static,
    RU: RuleRepository + Clone + Send + Sync + 'static,
    ND: NodeRepository + Send + Sync + 'static,
    RG: ResourceGroupRepository + Send + Sync + 'static,
    PL: PlanRepository + Send + Sync + 'static,
    TX: TransactionManager + Send + Sync + 'static,
    QA: RuleQuotaCheck + Send + Sync + 'static,
    CH: ChainRepository + Send + Sync + 'static,
    C: AgentStatusCache + RuleStatusCache + Send + Sync + 'static,
    FT: crate::repository::ForwardTrafficCache + Send + Sync + 'static,
{
    let (session, outbound_rx) = AgentSession::new(agent.id, agent.sid.clone(), state.session_config.send_queue_depth);

    if let Some(displaced) = state.registry.register(session.clone()) {
        tracing::info!(agent_id = agent.id, "displacing prior session for this agent");
        let _ = displaced.close().await;
    }

    let (ws_sink, ws_stream) = socket.split();
    let writer = tokio::spawn(run_writer(
        ws_sink,
        outbound_rx,
        state.session_config.write_deadline(),
        state.session_config.ping_interval(),
    ));

    if let Err(e) = establish_full_sync(&state, &agent).await {
        tracing::warn!(agent_id = agent.id, error = %e, "full sync on connect failed");
    }

    run_reader(ws_stream, &state, &agent).await;

    state.registry.remove_if_current(agent.id, |current| current.agent_sid == session.agent_sid);
    let _ = session.close().await;
    writer.abort();
    tracing::info!(agent_id = agent.id, "agent session closed");
}

async fn establish_full_sync<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(state: &AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>, agent: &Agent) -> crate::error::Result<()>
where
    AG: AgentRepository,
    RU: RuleRepository,
    C: AgentStatusCache + RuleStatusCache,
{
    let rules = state.rules.list_enabled_by_agent_id(agent.id).await?;
    let mut ids: Vec<u64> = rules.iter().flat_map(|r| r.participant_agent_ids()).collect();
    ids.sort_unstable();
    ids.dedup();
    let agents_by_id = state.agents.get_by_ids(&ids).await?;
    let known_ws_ports = state.known_ws_ports.snapshot();
    let ctx = ProjectionContext {
        agents_by_id: &agents_by_id,
        known_ws_ports: &known_ws_ports,
        server_secret: &state.server_secret,
    };

    let minted = AgentToken::generate(&agent.sid, &state.server_secret);
    state.sync.full_sync(agent.id, &rules, &ctx, minted.token, hex::encode(state.server_secret.as_slice()));
    state.sync.clear_resync_flag(agent.id);
    Ok(())
}

/// Single writer task: owns the socket, drains the send queue, and pings on
/// a fixed interval (§4.5 "Write discipline", §5 "Timeouts").
async fn run_writer(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<OutboundMessage>,
    write_deadline: Duration,
    ping_interval: Duration,
) {
    let mut ping_interval = tokio::time::interval(ping_interval);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            message = outbound_rx.recv() => {
                match message {
                    Some(OutboundMessage::Text(payload)) => {
                        if tokio::time::timeout(write_deadline, sink.send(Message::Text(payload.into()))).await.is_err() {
                            tracing::warn!("write deadline exceeded, closing session");
                            break;
                        }
                    }
                    Some(OutboundMessage::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if tokio::time::timeout(write_deadline, sink.send(Message::Ping(Vec::new().into()))).await.is_err() {
                    tracing::warn!("ping write deadline exceeded, closing session");
                    break;
                }
            }
        }
    }
}

/// Single reader task: decodes frames, extends the liveness deadline on
/// every pong, and dispatches by envelope `type` (§4.5 "Read discipline").
async fn run_reader<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(
    mut stream: futures::stream::SplitStream<WebSocket>,
    state: &AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>,
    agent: &Agent,
) where
    AG: AgentRepository + Clone + Send + Sync + 'static,
    RU: RuleRepository + Clone + Send + Sync + 'static,
    ND: NodeRepository + Send + Sync + 'static,
    RG: ResourceGroupRepository + Send + Sync + 'static,
    PL: PlanRepository + Send + Sync + 'static,
    TX: TransactionManager + Send + Sync + 'static,
    QA: RuleQuotaCheck + Send + Sync + 'static,
    CH: ChainRepository + Send + Sync + 'static,
    C: AgentStatusCache + RuleStatusCache + Send + Sync + 'static,
    FT: crate::repository::ForwardTrafficCache + Send + Sync + 'static,
{
    let pong_wait = state.session_config.pong_wait();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let next = match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                tracing::debug!(agent_id = agent.id, error = %e, "websocket read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::info!(agent_id = agent.id, "pong deadline expired, closing session");
                break;
            }
        };

        match next {
            Message::Pong(_) => {
                deadline = Instant::now() + pong_wait;
            }
            Message::Ping(_) => {
                deadline = Instant::now() + pong_wait;
            }
            Message::Text(text) => {
                deadline = Instant::now() + pong_wait;
                dispatch_envelope(state, agent, &text).await;
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::debug!(agent_id = agent.id, "dropping unexpected binary frame");
            }
        }
    }
}

async fn dispatch_envelope<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(state: &AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>, agent: &Agent, text: &str)
where
    AG: AgentRepository + Clone + Send + Sync + 'static,
    RU: RuleRepository + Clone + Send + Sync + 'static,
    ND: NodeRepository + Send + Sync + 'static,
    RG: ResourceGroupRepository + Send + Sync + 'static,
    PL: PlanRepository + Send + Sync + 'static,
    TX: TransactionManager + Send + Sync + 'static,
    QA: RuleQuotaCheck + Send + Sync + 'static,
    CH: ChainRepository + Send + Sync + 'static,
    C: AgentStatusCache + RuleStatusCache + Send + Sync + 'static,
    FT: crate::repository::ForwardTrafficCache + Send + Sync + 'static,
{
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(agent_id = agent.id, error = %e, "dropping malformed envelope");
            return;
        }
    };

    match envelope.message_type {
        MessageType::Status => handle_status(state, agent, envelope.data).await,
        MessageType::Heartbeat => {
            tracing::trace!(agent_id = agent.id, "heartbeat");
        }
        MessageType::Event => {
            tracing::info!(agent_id = agent.id, event = %envelope.data, "agent event");
        }
        MessageType::ProbeResult => {
            tracing::debug!(agent_id = agent.id, result = %envelope.data, "probe result received");
        }
        MessageType::ConfigAck => {
            if let Ok(ack) = serde_json::from_value::<ConfigAck>(envelope.data) {
                state.sync.handle_ack(agent.id, &ack);
            }
        }
        MessageType::Command | MessageType::ProbeTask | MessageType::ConfigSync => {
            tracing::warn!(agent_id = agent.id, ?envelope.message_type, "dropping control-plane-only message type from agent");
        }
    }
}

async fn handle_status<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(state: &AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>, agent: &Agent, data: serde_json::Value)
where
    AG: AgentRepository + Clone + Send + Sync + 'static,
    RU: RuleRepository + Clone + Send + Sync + 'static,
    ND: NodeRepository + Send + Sync + 'static,
    RG: ResourceGroupRepository + Send + Sync + 'static,
    PL: PlanRepository + Send + Sync + 'static,
    TX: TransactionManager + Send + Sync + 'static,
    QA: RuleQuotaCheck + Send + Sync + 'static,
    CH: ChainRepository + Send + Sync + 'static,
    C: AgentStatusCache + RuleStatusCache + Send + Sync + 'static,
    FT: crate::repository::ForwardTrafficCache + Send + Sync + 'static,
{
    let report: StatusReport = match serde_json::from_value(data) {
        Ok(report) => report,
        Err(e) => {
            tracing::debug!(agent_id = agent.id, error = %e, "malformed status report");
            return;
        }
    };

    let ws_port = report.ws_listen_port;
    let tls_port = report.tls_listen_port;

    if let Err(e) = state.status.apply_status_report(agent.id, report).await {
        tracing::warn!(agent_id = agent.id, error = %e, "failed to apply status report");
        return;
    }

    let mut port_changed = false;
    if let Some(port) = ws_port {
        port_changed |= state.known_ws_ports.record(agent.id, TunnelType::Ws, port);
    }
    if let Some(port) = tls_port {
        port_changed |= state.known_ws_ports.record(agent.id, TunnelType::Tls, port);
    }

    if port_changed {
        if let Err(e) = state.rule_service.propagate_agent_topology_change(agent.id).await {
            tracing::warn!(agent_id = agent.id, error = %e, "failed to propagate port change");
        }
    }
}
