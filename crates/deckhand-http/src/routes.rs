//! REST handlers for `/health` and `/api/agents`.
//!
//! Every handler answers JSON. Reads of an unknown agent are 404; any failed
//! mutation is 400 with `{ "error": "<message>" }`. After a successful
//! mutation the handler re-reads the agent and broadcasts it.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use deckhand_core::{AgentId, AgentStatus, SupervisorError};

use crate::state::SharedState;

pub type ApiResponse = (StatusCode, Json<Value>);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentRequest {
    pub issue_key: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub issue_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    pub message: Option<String>,
}

fn error(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

fn bad_request(err: SupervisorError) -> ApiResponse {
    error(StatusCode::BAD_REQUEST, err.to_string())
}

fn success() -> ApiResponse {
    (StatusCode::OK, Json(json!({ "success": true })))
}

/// Optional JSON body: empty means default.
fn parse_body<T: Default + for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ApiResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| error(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", e)))
}

/// GET /health
pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "agents": state.supervisor.len(),
        "wsClients": state.ws_client_count(),
    }))
}

/// POST /api/agents
pub async fn create_agent(State(state): State<SharedState>, body: Bytes) -> ApiResponse {
    let request: CreateAgentRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state
        .supervisor
        .spawn(request.issue_key, request.auto_start)
        .await
    {
        Ok(agent) => {
            state.event_bus.agent_created(&agent);
            (StatusCode::CREATED, Json(json!(agent)))
        }
        Err(e) => bad_request(e),
    }
}

/// GET /api/agents
pub async fn list_agents(State(state): State<SharedState>) -> ApiResponse {
    (StatusCode::OK, Json(json!(state.supervisor.list_agents())))
}

/// GET /api/agents/{id}
pub async fn get_agent(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResponse {
    match state.supervisor.get_agent(&AgentId::from(id)) {
        Ok(agent) => (StatusCode::OK, Json(json!(agent))),
        Err(e) => error(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// GET /api/agents/{id}/logs
pub async fn agent_logs(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResponse {
    match state.supervisor.logs(&AgentId::from(id)) {
        Ok(logs) => (StatusCode::OK, Json(json!({ "logs": logs }))),
        Err(e) => error(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// POST /api/agents/{id}/assign
///
/// Rebinds the work key, then starts the agent if it is sitting idle or in
/// error with no process. A failed start does not fail the assignment; it is
/// reported as `startFailed` / `startError`.
pub async fn assign_work(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResponse {
    let issue_key = match serde_json::from_slice::<AssignRequest>(&body) {
        Ok(AssignRequest {
            issue_key: Some(key),
        }) if !key.trim().is_empty() => key,
        _ => return error(StatusCode::BAD_REQUEST, "issueKey is required"),
    };

    let id = AgentId::from(id);
    let mut agent = match state.supervisor.assign_work(&id, issue_key) {
        Ok(agent) => agent,
        Err(e) => return bad_request(e),
    };

    let mut start_error = None;
    if matches!(agent.status, AgentStatus::Idle | AgentStatus::Error) && !agent.process_alive {
        match state.supervisor.start_agent(&id).await {
            Ok(started) if started.status == AgentStatus::Error => {
                start_error = Some(
                    started
                        .logs
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "Failed to start agent".to_string()),
                );
                agent = started;
            }
            Ok(started) => agent = started,
            Err(e) => {
                log::warn!("Assigned {} but could not start it: {}", id, e);
                start_error = Some(e.to_string());
            }
        }
    }

    state.event_bus.agent_updated(&agent);

    let mut response = json!({ "success": true });
    if let Some(message) = start_error {
        response["startFailed"] = json!(true);
        response["startError"] = json!(message);
    }
    (StatusCode::OK, Json(response))
}

/// POST /api/agents/{id}/start
pub async fn start_agent(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResponse {
    match state.supervisor.start_agent(&AgentId::from(id)).await {
        Ok(agent) => {
            state.event_bus.agent_updated(&agent);
            success()
        }
        Err(e) => bad_request(e),
    }
}

/// POST /api/agents/{id}/approve
pub async fn approve_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResponse {
    let request: ApproveRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state
        .supervisor
        .approve_and_continue(&AgentId::from(id), request.message)
        .await
    {
        Ok(agent) => {
            state.event_bus.agent_updated(&agent);
            success()
        }
        Err(e) => bad_request(e),
    }
}

/// POST /api/agents/{id}/stop
pub async fn stop_agent(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResponse {
    match state.supervisor.stop_agent(&AgentId::from(id)) {
        Ok(agent) => {
            state.event_bus.agent_stopped(&agent);
            success()
        }
        Err(e) => bad_request(e),
    }
}

// ============================================================================
// TESTS
// ============================================================================
