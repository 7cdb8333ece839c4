//! HTTP surface over the registry, the capability facade and the chat loop.

use crate::chat::{ChatMessage, ChatTurnRunner, GeminiModel};
use crate::config::Config;
use crate::mcp::{self, CapabilityFacade, ConnectionRegistry, OperationResult, ServerConfig};
use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub facade: CapabilityFacade,
    /// `None` when no model is configured; `/chat` then answers 503.
    pub runner: Option<Arc<ChatTurnRunner>>,
}

impl AppState {
    pub fn new(registry: Arc<ConnectionRegistry>, runner: Option<Arc<ChatTurnRunner>>) -> Self {
        Self {
            facade: CapabilityFacade::new(Arc::clone(&registry)),
            registry,
            runner,
        }
    }

    /// Production wiring: real transports, plus a model when a key is available.
    pub fn from_config(config: &Config) -> Self {
        let registry =
            mcp::production_registry(config.mcp.connect_timeout(), config.mcp.call_timeout());
        let facade = CapabilityFacade::new(Arc::clone(&registry));
        let runner = match GeminiModel::new(&config.model) {
            Ok(model) => Some(Arc::new(ChatTurnRunner::new(
                facade.clone(),
                Arc::new(model),
                config.mcp.turn_settings(),
            ))),
            Err(e) => {
                tracing::warn!(error = %e, "Chat disabled");
                None
            }
        };
        Self {
            registry,
            facade,
            runner,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallToolBody {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GetPromptBody {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ReadResourceBody {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    messages: Vec<ChatMessage>,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers).post(connect_server))
        .route("/servers/{id}", delete(disconnect_server))
        .route("/servers/{id}/status", get(server_status))
        .route("/servers/{id}/tools", get(list_tools))
        .route("/servers/{id}/tools/call", post(call_tool))
        .route("/servers/{id}/prompts", get(list_prompts))
        .route("/servers/{id}/prompts/get", post(get_prompt))
        .route("/servers/{id}/resources", get(list_resources))
        .route("/servers/{id}/resources/read", post(read_resource))
        .route("/chat", post(chat))
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(max_body_bytes)))
        .with_state(state)
}

/// Bind, serve until ctrl-c or SIGTERM, then sweep every live connection.
pub async fn serve(config: &Config, state: AppState) -> Result<()> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, chat = state.runner.is_some(), "Gateway listening");

    serve_until(listener, state, config.gateway.max_body_bytes, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then disconnect every server.
pub async fn serve_until<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    max_body_bytes: usize,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = Arc::clone(&state.registry);
    let served = axum::serve(listener, router(state, max_body_bytes))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Gateway server error");

    registry.shutdown().await;
    served
}

/// Resolves on ctrl-c, or SIGTERM on unix. SIGKILL bypasses the sweep;
/// stdio children then only see their stdin close.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown requested");
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<mcp::ServerSummary>> {
    Json(state.registry.servers())
}

async fn connect_server(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<OperationResult>) {
    let config = match ServerConfig::from_value(body) {
        Ok(config) => config,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(OperationResult::failed(e))),
    };
    (StatusCode::OK, Json(state.registry.connect(config).await))
}

/// Disconnect only fails for unknown ids.
async fn disconnect_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<OperationResult>) {
    let result = state.registry.disconnect(&id).await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(result))
}

async fn server_status(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let status = state.registry.status(&id);
    Json(json!({ "id": id, "status": status }))
}

async fn list_tools(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    Json(state.facade.list_tools(&id).await).into_response()
}

async fn list_prompts(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    Json(state.facade.list_prompts(&id).await).into_response()
}

async fn list_resources(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    Json(state.facade.list_resources(&id).await).into_response()
}

async fn call_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CallToolBody>,
) -> Response {
    Json(state.facade.call_tool(&id, &body.name, body.arguments).await).into_response()
}

async fn get_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<GetPromptBody>,
) -> Response {
    Json(state.facade.get_prompt(&id, &body.name, body.arguments).await).into_response()
}

async fn read_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReadResourceBody>,
) -> Response {
    Json(state.facade.read_resource(&id, &body.uri).await).into_response()
}

async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Response {
    let Some(runner) = state.runner else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no model configured" })),
        )
            .into_response();
    };
    match runner.run(&body.messages).await {
        Ok(turn) => Json(turn).into_response(),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "Chat turn failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response()
        }
    }
}
