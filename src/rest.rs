//! The agent-facing REST fallback for forwarders that cannot hold a
//! WebSocket open (§6.3). Three endpoints, all bearer-auth with the agent's
//! plain token via [`crate::session::auth::authenticate`].

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domain::rule::TunnelType;
use crate::error::Error;
use crate::repository::{
    AgentRepository, AgentStatusCache, ChainRepository, ForwardTrafficCache, NodeRepository,
    PlanRepository, ResourceGroupRepository, RuleRepository, RuleStatusCache, TransactionManager,
};
use crate::services::quota_service::RuleQuotaCheck;
use crate::session::auth;
use crate::sync::projection::{project, ProjectionContext};
use crate::websocket_handler::AppState;

/// Response body mirrored after the teacher's own `ErrorResponse`: a
/// human message plus the machine-readable [`Error::kind`] tag.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

/// Converts a failed lookup into the error-body response the fallback
/// endpoints return. A thin wrapper so the WebSocket upgrade handler, which
/// never produces a `Json<T>` success body of its own, can share it.
pub fn error_response(err: Error) -> Response {
    err.into_response()
}

/// Pulls the plain agent token out of a `Authorization: Bearer <token>`
/// header (§6.3 "all endpoints are bearer-auth with the agent's plain
/// token").
fn bearer_token(headers: &HeaderMap) -> Result<&str, Error> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::forbidden("missing or malformed bearer token"))
}

#[derive(Debug, Serialize)]
pub struct RulesSnapshotResponse {
    pub rules: Vec<crate::session::envelope::RuleSyncData>,
    pub client_token: String,
}

/// `GET /forward-agent-api/rules` (§6.3) — full enabled-rules snapshot for
/// the authenticated agent, reusing the same per-agent projection the
/// WebSocket `config_sync` path emits.
pub async fn get_rules<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(
    State(state): State<AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>>,
    headers: HeaderMap,
) -> Result<Json<RulesSnapshotResponse>, Error>
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
    FT: ForwardTrafficCache + Send + Sync + 'static,
{
    let token = bearer_token(&headers)?;
    let agent = auth::authenticate(token, &state.server_secret, &state.agents).await?;

    let rules = state.rules.list_enabled_by_agent_id(agent.id).await?;
    let mut participant_ids: Vec<u64> = rules.iter().flat_map(|r| r.participant_agent_ids()).collect();
    participant_ids.sort_unstable();
    participant_ids.dedup();
    let agents_by_id = state.agents.get_by_ids(&participant_ids).await?;
    let known_ws_ports = state.known_ws_ports.snapshot();
    let ctx = ProjectionContext {
        agents_by_id: &agents_by_id,
        known_ws_ports: &known_ws_ports,
        server_secret: &state.server_secret,
    };

    let projected = rules
        .iter()
        .filter_map(|rule| project(rule, agent.id, &ctx))
        .collect();

    let client_token = crate::ids::token::AgentToken::generate(&agent.sid, &state.server_secret).token;

    Ok(Json(RulesSnapshotResponse {
        rules: projected,
        client_token,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TrafficReportRequest {
    pub rules: Vec<TrafficReportEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TrafficReportEntry {
    pub rule_id: u64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

/// `POST /forward-agent-api/traffic` (§6.3) — accumulates per-rule counters
/// for agents polling this fallback instead of reporting over the socket.
pub async fn post_traffic<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(
    State(state): State<AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>>,
    headers: HeaderMap,
    Json(report): Json<TrafficReportRequest>,
) -> Result<StatusCode, Error>
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
    FT: ForwardTrafficCache + Send + Sync + 'static,
{
    let token = bearer_token(&headers)?;
    auth::authenticate(token, &state.server_secret, &state.agents).await?;

    for entry in &report.rules {
        state
            .traffic_cache
            .record_rule_traffic(entry.rule_id, entry.upload_bytes, entry.download_bytes)
            .await?;
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct ExitEndpointResponse {
    pub address: String,
    pub ws_listen_port: Option<u16>,
}

/// `GET /forward-agent-api/exit-endpoint/:exitAgentID` (§6.3) — the dial-out
/// address and last-known tunnel listen port for a chain's next hop.
pub async fn get_exit_endpoint<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>(
    State(state): State<AppState<AG, RU, ND, RG, PL, TX, QA, CH, C, FT>>,
    headers: HeaderMap,
    Path(exit_agent_sid): Path<String>,
) -> Result<Json<ExitEndpointResponse>, Error>
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
    FT: ForwardTrafficCache + Send + Sync + 'static,
{
    let token = bearer_token(&headers)?;
    auth::authenticate(token, &state.server_secret, &state.agents).await?;

    let sid: crate::ids::short_id::ShortId = exit_agent_sid
        .parse()
        .map_err(|_| Error::validation("malformed exit agent short id"))?;

    let exit_agent = state
        .agents
        .get_by_sid(&sid)
        .await?
        .ok_or_else(|| Error::not_found("exit agent not found"))?;

    Ok(Json(ExitEndpointResponse {
        address: exit_agent.tunnel_address,
        ws_listen_port: state.known_ws_ports.get(exit_agent.id, TunnelType::Ws),
    }))
}
