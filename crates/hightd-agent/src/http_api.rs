use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::AgentConfig;
use crate::console;
use crate::filemanager;
use crate::instance::{InstanceStatus, ServerInstance};
use crate::live_events::EventCategory;
use crate::registry::ServerRegistry;
use crate::remote::RemoteClient;
use crate::sandbox::PathError;
use crate::start_spec::StartData;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub registry: Arc<ServerRegistry>,
    pub remote: RemoteClient,
}

/// Boundary classification of failures; everything internal stays anyhow.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or ill-typed fields.
    Input(String),
    /// The shared token was absent.
    TokenMissing,
    /// Token mismatch or permission denied.
    Forbidden(String),
    NotFound(String),
    PayloadTooLarge(String),
    /// Container runtime or filesystem failure; the caller gets the message
    /// and the instance is already rolled back.
    Runtime(String),
}

impl From<PathError> for ApiError {
    fn from(err: PathError) -> Self {
        ApiError::Forbidden(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            ApiError::Input(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::TokenMissing => (StatusCode::BAD_REQUEST, "token is required".to_string()),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m),
            ApiError::Runtime(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (code, Json(json!({ "status": "error", "message": message })))
            .into_response()
    }
}

pub fn check_token(state: &AppState, token: Option<&str>) -> Result<(), ApiError> {
    match token {
        None => Err(ApiError::TokenMissing),
        Some(t) if t.is_empty() => Err(ApiError::TokenMissing),
        Some(t) if t == state.config.token => Ok(()),
        Some(_) => Err(ApiError::Forbidden("invalid token".to_string())),
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Input(format!("{field} is required")))
}

/// Token + user permission + instance lookup, the precondition shared by
/// every per-server operation.
pub async fn authorize_server(
    state: &AppState,
    token: Option<&str>,
    server_id: &Option<String>,
    user_uuid: &Option<String>,
) -> Result<Arc<ServerInstance>, ApiError> {
    check_token(state, token)?;
    let server_id = required(server_id, "serverId")?;
    let user_uuid = required(user_uuid, "userUuid")?;

    let instance = state
        .registry
        .get(server_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown server {server_id}")))?;

    if !state.remote.has_permission(user_uuid, server_id).await {
        return Err(ApiError::Forbidden("permission denied".to_string()));
    }
    Ok(instance)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", post(agent_status))
        .route("/api/v1/servers/create", post(create_server))
        .route("/api/v1/servers/delete", post(delete_server))
        .route("/api/v1/servers/status", post(server_status))
        .route("/api/v1/servers/usage", post(server_usage))
        .route("/api/v1/servers/action", post(server_action))
        .route("/api/v1/servers/console", get(console::ws_handler))
        .nest("/api/v1/servers/filemanager", filemanager::router())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: Option<String>,
}

async fn agent_status(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<TokenBody>,
) -> Result<Json<Value>, ApiError> {
    check_token(&state, body.token.as_deref())?;
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerBody {
    token: Option<String>,
    server_id: Option<String>,
    user_uuid: Option<String>,
}

async fn require_admin(state: &AppState, body: &ServerBody) -> Result<String, ApiError> {
    check_token(state, body.token.as_deref())?;
    let server_id = required(&body.server_id, "serverId")?.to_string();
    let user_uuid = required(&body.user_uuid, "userUuid")?;
    if !state.remote.is_admin(user_uuid).await {
        return Err(ApiError::Forbidden("admin permission required".to_string()));
    }
    Ok(server_id)
}

async fn create_server(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<ServerBody>,
) -> Result<Json<Value>, ApiError> {
    let server_id = require_admin(&state, &body).await?;
    state
        .registry
        .create(&server_id)
        .await
        .map_err(|e| ApiError::Input(e.to_string()))?;
    Ok(Json(json!({ "status": "success" })))
}

async fn delete_server(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<ServerBody>,
) -> Result<Json<Value>, ApiError> {
    let server_id = require_admin(&state, &body).await?;
    if state.registry.get(&server_id).await.is_none() {
        return Err(ApiError::NotFound(format!("unknown server {server_id}")));
    }
    state
        .registry
        .remove(&server_id)
        .await
        .map_err(|e| ApiError::Runtime(e.to_string()))?;
    Ok(Json(json!({ "status": "success" })))
}

async fn server_status(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<ServerBody>,
) -> Result<Json<Value>, ApiError> {
    let instance =
        authorize_server(&state, body.token.as_deref(), &body.server_id, &body.user_uuid).await?;
    let status = instance.status().await;
    Ok(Json(json!({
        "status": "success",
        "serverStatus": status.as_str(),
    })))
}

async fn server_usage(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<ServerBody>,
) -> Result<Json<Value>, ApiError> {
    let instance =
        authorize_server(&state, body.token.as_deref(), &body.server_id, &body.user_uuid).await?;

    let status = instance.status().await;
    let (_, started_at) = instance.snapshot().await;

    let usage = if status == InstanceStatus::Running {
        let snapshot = instance
            .usages()
            .await
            .map_err(|e| ApiError::Runtime(e.to_string()))?;
        let memory_percent = if snapshot.memory_limit_bytes > 0 {
            let raw =
                snapshot.memory_bytes as f64 / snapshot.memory_limit_bytes as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        } else {
            0.0
        };
        let uptime_ms = started_at
            .map(|t| (chrono::Utc::now().timestamp_millis() - t).max(0))
            .unwrap_or(0);
        json!({
            "cpu": snapshot.cpu_percent,
            "memory": snapshot.memory_bytes,
            "memoryLimit": snapshot.memory_limit_bytes,
            "memoryPercent": memory_percent,
            "startedAt": started_at,
            "uptimeMs": uptime_ms,
            "state": status.as_str(),
        })
    } else {
        json!({
            "cpu": 0.0,
            "memory": 0,
            "memoryLimit": 0,
            "memoryPercent": 0.0,
            "startedAt": Value::Null,
            "uptimeMs": 0,
            "state": status.as_str(),
        })
    };

    Ok(Json(json!({ "status": "success", "usage": usage })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionBody {
    token: Option<String>,
    server_id: Option<String>,
    user_uuid: Option<String>,
    action: Option<String>,
    command: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

fn parse_start_data(rest: &serde_json::Map<String, Value>) -> Result<StartData, ApiError> {
    serde_json::from_value(Value::Object(rest.clone()))
        .map_err(|e| ApiError::Input(format!("invalid start data: {e}")))
}

async fn server_action(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<ActionBody>,
) -> Result<Json<Value>, ApiError> {
    let instance =
        authorize_server(&state, body.token.as_deref(), &body.server_id, &body.user_uuid).await?;
    let action = required(&body.action, "action")?;

    match action {
        "start" => {
            let data = parse_start_data(&body.rest)?;
            instance
                .start(&data)
                .await
                .map_err(|e| ApiError::Runtime(e.to_string()))?;
        }
        "restart" => {
            let data = parse_start_data(&body.rest)?;
            instance
                .restart(&data)
                .await
                .map_err(|e| ApiError::Runtime(e.to_string()))?;
        }
        "stop" => {
            let command = required(&body.command, "command")?;
            instance.stop(command).await;
        }
        "kill" => {
            instance.kill().await;
        }
        "command" => {
            let command = required(&body.command, "command")?;
            instance.emit(EventCategory::Command, command);
            instance
                .send_command(command)
                .await
                .map_err(|e| ApiError::Runtime(e.to_string()))?;
        }
        other => {
            return Err(ApiError::Input(format!("unknown action {other:?}")));
        }
    }

    Ok(Json(json!({ "status": "success" })))
}
