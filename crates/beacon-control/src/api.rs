use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use beacon_lifecycle::{ServerState, StatusReport};
use serde::{Deserialize, Serialize};

use crate::controller::{LifecycleController, Outcome};
use crate::notify::{ContextId, Destination};

pub const HELP_TEXT: &str = "\
start   - boot the server (takes 4-5 minutes)
stop    - shut the server down
status  - show the server's state and who is online
restart - restart the game server without releasing the instance
help    - show this message";

#[derive(Clone)]
pub struct AppState {
    pub controller: LifecycleController,
    pub command_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandRequest {
    pub context: String,
    #[serde(default)]
    pub webhook: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub outcome: &'static str,
    pub state: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<StatusReport>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    outcome: &'static str,
    message: String,
}

fn error_response(status: StatusCode, outcome: &'static str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        outcome,
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    state: ServerState,
    targets: usize,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let authorized = match state.command_token.as_deref() {
        Some(expected) => bearer_token(req.headers()) == Some(expected),
        None => true,
    };
    if !authorized {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid bearer token");
    }
    next.run(req).await
}

/// Registers the webhook for the context (last write wins) and resolves where
/// replies for this request go.
async fn resolve_target(state: &AppState, req: CommandRequest) -> Option<Destination> {
    let registry = state.controller.reporter().registry();
    let context = ContextId(req.context);
    match req.webhook.filter(|w| !w.trim().is_empty()) {
        Some(webhook) => {
            let destination = Destination(webhook);
            if registry.register(context.clone(), destination.clone()).await.is_none() {
                tracing::info!(context = %context.0, "registered notification target");
            }
            Some(destination)
        }
        None => registry.get(&context).await,
    }
}

async fn respond(state: &AppState, outcome: Outcome) -> Response {
    let current = state.controller.state().await;
    let code = match &outcome {
        Outcome::Busy => StatusCode::CONFLICT,
        Outcome::Failed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };
    let (address, error) = match outcome.clone() {
        Outcome::Started { address } | Outcome::AlreadyRunning { address } => (address, None),
        Outcome::Failed(err) => (None, Some(err.to_string())),
        _ => (None, None),
    };
    let body = CommandResponse {
        outcome: outcome.code(),
        state: current,
        address,
        error,
        report: None,
    };
    (code, Json(body)).into_response()
}

/// Sequences run on their own task: a client hanging up drops this handler,
/// but must not cancel a cloud start or stop halfway.
async fn drive<F>(state: &AppState, sequence: F) -> Response
where
    F: Future<Output = Outcome> + Send + 'static,
{
    match tokio::spawn(sequence).await {
        Ok(outcome) => respond(state, outcome).await,
        Err(err) => {
            tracing::error!(%err, "lifecycle sequence task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed", "lifecycle sequence aborted")
        }
    }
}

async fn start(State(state): State<AppState>, Json(req): Json<CommandRequest>) -> Response {
    let target = resolve_target(&state, req).await;
    let controller = state.controller.clone();
    drive(&state, async move { controller.request_start(target.as_ref()).await }).await
}

async fn stop(State(state): State<AppState>, Json(req): Json<CommandRequest>) -> Response {
    let target = resolve_target(&state, req).await;
    let controller = state.controller.clone();
    drive(&state, async move { controller.request_stop(target.as_ref()).await }).await
}

async fn restart(State(state): State<AppState>, Json(req): Json<CommandRequest>) -> Response {
    let target = resolve_target(&state, req).await;
    let controller = state.controller.clone();
    drive(&state, async move { controller.request_restart(target.as_ref()).await }).await
}

async fn status(State(state): State<AppState>, Json(req): Json<CommandRequest>) -> Response {
    // Unregistered callers without a webhook only get the JSON report.
    let target = resolve_target(&state, req).await;
    let report = state.controller.request_status(target.as_ref()).await;
    Json(CommandResponse {
        outcome: "reported",
        state: state.controller.state().await,
        address: None,
        error: None,
        report: Some(report),
    })
    .into_response()
}

async fn help() -> &'static str {
    HELP_TEXT
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        state: state.controller.state().await,
        targets: state.controller.reporter().registry().len().await,
    })
}

pub fn router(state: AppState) -> Router {
    let commands = Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", post(status))
        .route("/restart", post(restart))
        .route("/help", get(help))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/minecraft", commands)
        .with_state(state)
}
