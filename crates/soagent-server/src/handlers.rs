//! HTTP request handlers. JSON keys are camelCase; mutation endpoints
//! answer with an `{ok: bool, ...}` envelope, the session list and search
//! return bare arrays.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use soagent_core::ids::{SessionId, ToolUseId};
use soagent_core::provider::{Attachment, PermissionMode, ProviderEnv};
use soagent_provider::verify_provider;
use soagent_store::StoreError;

use crate::orchestrator::{OrchestratorError, SendOptions, SendOutcome};
use crate::server::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn fail(status: StatusCode, error: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "ok": false, "error": error.to_string() })))
}

fn store_fail(e: OrchestratorError) -> (StatusCode, Json<Value>) {
    let OrchestratorError::Store(store) = &e;
    let status = match store {
        StoreError::InvalidId(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, e)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "port": state.port }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBody {
    message: String,
    #[serde(default)]
    workspace_ref: Option<PathBuf>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    permission_mode: Option<PermissionMode>,
    #[serde(default)]
    allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    provider_env: Option<ProviderEnv>,
    #[serde(default)]
    images: Vec<Attachment>,
    #[serde(default)]
    mcp_enabled_server_ids: Vec<String>,
}

pub async fn send(State(state): State<AppState>, Json(body): Json<SendBody>) -> ApiResult {
    let workspace_dir = body
        .workspace_ref
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let opts = SendOptions {
        text: body.message,
        workspace_dir,
        model: body.model,
        permission_mode: body.permission_mode.unwrap_or_default(),
        allowed_tools: body.allowed_tools,
        env: body.provider_env,
        attachments: body.images,
        mcp_servers: state.mcp.load_enabled(&body.mcp_enabled_server_ids),
    };

    match state.orchestrator.send_message(opts).await {
        Ok(SendOutcome::Started { session_id }) => {
            Ok(Json(json!({ "ok": true, "sessionId": session_id })))
        }
        Ok(SendOutcome::Busy) => Ok(Json(json!({ "ok": true, "busy": true }))),
        Err(e) => Err(store_fail(e)),
    }
}

pub async fn stop(State(state): State<AppState>) -> Json<Value> {
    state.orchestrator.stop();
    Json(json!({ "ok": true }))
}

pub async fn reset(State(state): State<AppState>) -> Json<Value> {
    state.orchestrator.reset().await;
    Json(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponseBody {
    tool_use_id: ToolUseId,
    allow: bool,
}

pub async fn permission_response(
    State(state): State<AppState>,
    Json(body): Json<PermissionResponseBody>,
) -> Json<Value> {
    let handled = state
        .orchestrator
        .respond_permission(&body.tool_use_id, body.allow);
    Json(json!({ "ok": true, "handled": handled }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResponseBody {
    tool_use_id: ToolUseId,
    #[serde(default)]
    answers: HashMap<String, String>,
}

pub async fn question_response(
    State(state): State<AppState>,
    Json(body): Json<QuestionResponseBody>,
) -> Json<Value> {
    let handled = state
        .orchestrator
        .respond_question(&body.tool_use_id, body.answers);
    Json(json!({ "ok": true, "handled": handled }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSessionBody {
    session_id: SessionId,
}

pub async fn load_session(
    State(state): State<AppState>,
    Json(body): Json<LoadSessionBody>,
) -> ApiResult {
    let messages = state
        .orchestrator
        .load_session(&body.session_id)
        .await
        .map_err(store_fail)?;
    Ok(Json(json!({ "ok": true, "messages": messages })))
}

pub async fn transcript(State(state): State<AppState>) -> Json<Value> {
    let messages = state.orchestrator.transcript().await;
    Json(json!({ "messages": messages }))
}

pub async fn agent_state(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "sessionId": state.orchestrator.active_session().await,
        "isRunning": state.orchestrator.is_running(),
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.store.list()))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: String,
}

pub async fn search(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> ApiResult {
    let results = state
        .store
        .search(&query.q)
        .map_err(|e| fail(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!(results)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ApiResult {
    state
        .store
        .delete(&id)
        .map_err(|e| store_fail(OrchestratorError::Store(e)))?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct RenameBody {
    title: String,
}

pub async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<RenameBody>,
) -> ApiResult {
    state
        .store
        .rename(&id, &body.title)
        .map_err(|e| store_fail(OrchestratorError::Store(e)))?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBody {
    #[serde(default)]
    env: Option<ProviderEnv>,
    #[serde(default)]
    model: Option<String>,
}

pub async fn verify(State(_state): State<AppState>, Json(body): Json<VerifyBody>) -> Json<Value> {
    let env = body.env.unwrap_or_default();
    let outcome = verify_provider(&env, body.model.as_deref()).await;
    Json(json!(outcome))
}
