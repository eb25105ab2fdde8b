//! HTTP Handlers

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};

use agent_core::{AgentError, Message, Role, ThreadId};
use weather_agent::WeatherContext;

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct InputMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub messages: Vec<InputMessage>,
    pub user_id: String,
    #[serde(default = "default_thread")]
    pub thread_id: String,
}

fn default_thread() -> String {
    ThreadId::default().to_string()
}

#[derive(Debug, Serialize)]
pub struct InvokeResult {
    /// Full thread transcript after this turn
    pub messages: Vec<Message>,
    pub structured_response: Option<serde_json::Value>,
    /// Final answer text
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct InvokeResponse {
    pub response: InvokeResult,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map an agent failure to a status code and user-facing body
fn api_error(err: &AgentError) -> ApiError {
    let (status, code) = match err {
        AgentError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
        AgentError::Config(_) => (StatusCode::BAD_REQUEST, "INVALID_CONTEXT"),
        AgentError::SchemaValidation { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "SCHEMA_VALIDATION"),
        AgentError::ProviderUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "PROVIDER_UNAVAILABLE"),
        AgentError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        AgentError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "PROVIDER_TIMEOUT"),
        e if e.is_provider_error() => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR"),
    };

    (
        status,
        Json(ErrorResponse {
            error: err.user_message(),
            code: code.into(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Run one agent turn on the requested thread
pub async fn invoke_handler(
    State(state): State<AppState>,
    Json(payload): Json<InvokeRequest>,
) -> Result<Json<InvokeResponse>, ApiError> {
    if let Some(m) = payload.messages.iter().find(|m| m.role == Role::Tool) {
        return Err(api_error(&AgentError::InvalidInput(format!(
            "role '{}' cannot be sent by a client",
            m.role
        ))));
    }

    let thread = ThreadId::new(payload.thread_id);
    let messages: Vec<Message> = payload
        .messages
        .into_iter()
        .map(|m| Message::new(m.role, m.content))
        .collect();
    let ctx = WeatherContext::new(payload.user_id);

    tracing::info!(thread = %thread, user = %ctx.user_id, count = messages.len(), "Invoking agent");

    let output = state
        .agent
        .invoke(&thread, messages, Some(ctx.into()))
        .await
        .map_err(|e| {
            tracing::error!(thread = %thread, "Agent error: {}", e);
            api_error(&e)
        })?;

    Ok(Json(InvokeResponse {
        response: InvokeResult {
            messages: output.messages,
            structured_response: output.structured,
            output: output.text,
        },
    }))
}
