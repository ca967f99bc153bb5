use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

mod config;
mod engine;
mod errors;
mod frames;
mod installer;
mod lifecycle;
mod monitor;
mod remote;
mod session;
mod state;
mod variables;

pub use config::AgentConfig;
pub use errors::{AgentError, AgentResult};

use engine::EngineClient;
use installer::Installer;
use lifecycle::LifecycleManager;
use remote::RemoteClient;
use session::ConsoleGateway;
use state::ServerRegistry;

/// Pylon Agent - Main application state
pub struct PylonAgent {
    pub config: Arc<AgentConfig>,
    pub engine: Arc<EngineClient>,
    pub remote: Arc<RemoteClient>,
    pub registry: Arc<ServerRegistry>,
    pub gateway: Arc<ConsoleGateway>,
    pub lifecycle: Arc<LifecycleManager>,
    pub installer: Arc<Installer>,
}

impl PylonAgent {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        info!("Initializing Pylon Agent");

        let config = Arc::new(config);
        let engine = Arc::new(EngineClient::new(config.engine.socket_path.clone()));
        let remote = Arc::new(RemoteClient::new(
            config.remote.base_url.clone(),
            config.remote.token.clone(),
        ));
        let registry = Arc::new(ServerRegistry::new());
        let gateway = Arc::new(ConsoleGateway::new(engine.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            engine.clone(),
            config.engine.container_root.clone(),
        ));
        let installer = Arc::new(Installer::new(
            config.clone(),
            engine.clone(),
            remote.clone(),
            registry.clone(),
            gateway.clone(),
            lifecycle.clone(),
        ));

        Arc::new(Self {
            config,
            engine,
            remote,
            registry,
            gateway,
            lifecycle,
            installer,
        })
    }

    pub async fn serve(self: Arc<Self>) -> AgentResult<()> {
        let bind_address = self.config.daemon.bind_address.clone();

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/ws", get(session::ws_handler))
            .route("/servers/{id}/install", post(install_handler))
            .route("/servers/{id}/reinstall", post(reinstall_handler))
            .route("/servers/{id}", delete(delete_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self);

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!("Pylon Agent listening on {}", bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| AgentError::InternalError(e.to_string()))
    }
}

fn authorized(headers: &HeaderMap, agent: &PylonAgent) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == agent.config.daemon.access_token)
        .unwrap_or(false)
}

async fn install_handler(
    State(agent): State<Arc<PylonAgent>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&headers, &agent) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid token"})));
    }

    let worker = agent.clone();
    tokio::spawn(async move {
        if let Err(err) = worker.installer.install(&id).await {
            error!("Installation of {} failed: {}", id, err);
        }
    });

    (StatusCode::ACCEPTED, Json(json!({"accepted": true})))
}

async fn reinstall_handler(
    State(agent): State<Arc<PylonAgent>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&headers, &agent) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid token"})));
    }

    let worker = agent.clone();
    tokio::spawn(async move {
        if let Err(err) = worker.installer.reinstall(&id).await {
            error!("Reinstallation of {} failed: {}", id, err);
        }
    });

    (StatusCode::ACCEPTED, Json(json!({"accepted": true})))
}

async fn delete_handler(
    State(agent): State<Arc<PylonAgent>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&headers, &agent) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid token"})));
    }

    match agent.installer.delete(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"deleted": true}))),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        ),
    }
}

#[tokio::main]
async fn main() -> AgentResult<()> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path.as_deref().unwrap_or("./config.toml");
    // Load config first so logging level/format can be applied.
    let config = AgentConfig::from_file(config_path)
        .or_else(|_| AgentConfig::from_file("/etc/pylon/config.toml"))
        .or_else(|_| AgentConfig::from_env())
        .map_err(AgentError::ConfigError)?;

    let filter = format!("pylon_agent={},tokio=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Pylon Agent starting");
    info!("Configuration loaded: {:?}", config);

    let agent = PylonAgent::new(config);
    agent.serve().await?;

    Ok(())
}
