// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// Thin control surface over the agent registry, trainer and scheduler.
// The backend service owns the public HTTP contract; this router exposes
// only what operators and the backend need to drive the core.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::agent_config::{AgentConfig, TraderConfig};
use crate::indicators::prepare_for_training;
use crate::registry::AgentRegistry;
use crate::scheduler::TraderScheduler;
use crate::trainer::{AgentTrainer, TrainError};
use crate::types::Bar;

/// Shared handles every route needs.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<AgentRegistry>,
    pub trainer: Arc<AgentTrainer>,
    pub scheduler: Arc<TraderScheduler>,
}

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // ── Agents ──────────────────────────────────────────────────
        .route("/api/agents", get(list_agents))
        .route("/api/agents/presets", get(list_presets))
        .route("/api/agents/:name", get(agent_status))
        .route("/api/agents/:name", delete(delete_agent))
        .route("/api/agents/:name/logs", get(agent_logs))
        .route("/api/agents/:name/train", post(train_agent))
        // ── Traders ─────────────────────────────────────────────────
        .route("/api/traders/:id/start", post(start_trader))
        .route("/api/traders/:id/stop", post(stop_trader))
        .route("/api/traders/:id/self-training", get(self_training_status))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Agents
// =============================================================================

async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn list_presets(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.presets())
}

async fn agent_status(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.status(&name) {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("agent not found: {name}") })),
        )
            .into_response(),
    }
}

async fn agent_logs(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    Json(state.registry.logs(&name))
}

async fn delete_agent(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if state.trainer.delete_agent(&name) {
        info!(agent = %name, "agent deleted");
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "failed to delete agent" })),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct TrainRequest {
    config: AgentConfig,
    /// Symbol -> OHLCV bars.
    training_data: HashMap<String, Vec<Bar>>,
    #[serde(default)]
    total_timesteps: Option<usize>,
    #[serde(default = "default_continue")]
    continue_training: bool,
}

fn default_continue() -> bool {
    true
}

/// Kick off a training session in the background. Returns 409 when one is
/// already running for this agent, 400 on unusable input.
async fn train_agent(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(request): Json<TrainRequest>,
) -> impl IntoResponse {
    if state.trainer.is_training(&name) {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": format!("training already in progress for {name}") })),
        )
            .into_response();
    }

    let mut frames = HashMap::new();
    for (symbol, bars) in &request.training_data {
        match prepare_for_training(bars) {
            Ok(frame) => {
                frames.insert(symbol.clone(), frame);
            }
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("{symbol}: {e}") })),
                )
                    .into_response();
            }
        }
    }

    let total_timesteps = request
        .total_timesteps
        .unwrap_or(state.trainer.settings().default_timesteps);
    let trainer = state.trainer.clone();
    let agent_name = name.clone();
    tokio::spawn(async move {
        let result = trainer
            .train_agent(
                &agent_name,
                request.config,
                frames,
                total_timesteps,
                request.continue_training,
                None,
            )
            .await;
        if let Err(TrainError::AlreadyTraining(_)) = result {
            // Raced with another start; the registry already reflects the
            // running session.
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "agent_name": name,
            "status": "training",
            "total_timesteps": total_timesteps,
        })),
    )
        .into_response()
}

// =============================================================================
// Traders
// =============================================================================

#[derive(Deserialize)]
struct StartTraderRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    personality: Option<serde_json::Value>,
    #[serde(default)]
    config: Option<TraderConfig>,
}

/// Start a trader from either an explicit config or a personality tree.
async fn start_trader(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(request): Json<StartTraderRequest>,
) -> impl IntoResponse {
    let config = match (request.config, request.personality) {
        (Some(mut config), _) => {
            config.trader_id = id;
            config
        }
        (None, Some(personality)) => {
            let name = request.name.unwrap_or_else(|| format!("Trader-{id}"));
            TraderConfig::from_personality(id, name, &personality)
        }
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "config or personality required" })),
            )
                .into_response();
        }
    };

    let started = state.scheduler.start_trader(config).await;
    Json(serde_json::json!({
        "trader_id": id,
        "started": started,
        "already_running": !started,
    }))
    .into_response()
}

async fn stop_trader(State(state): State<ApiState>, Path(id): Path<i64>) -> impl IntoResponse {
    let stopped = state.scheduler.stop_trader(id).await;
    Json(serde_json::json!({ "trader_id": id, "stopped": stopped }))
}

async fn self_training_status(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.scheduler.self_training_status(id) {
        Some(status) => Json(status).into_response(),
        None => Json(serde_json::json!({ "is_training": false, "status": "idle" })).into_response(),
    }
}
