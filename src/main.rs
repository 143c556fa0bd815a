// =============================================================================
// Meridian RL Trading Service — Main Entry Point
// =============================================================================
//
// An autonomous trading-agent service: concurrent per-trader control loops
// fuse four signal sources into decisions, gate them through layered risk
// checks, and execute against the backend. Idle traders continue-train
// their PPO policies on freshly fetched data.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agent_config;
mod api;
mod backend;
mod config;
mod engine;
mod env;
mod indicators;
mod policy;
mod registry;
mod risk;
mod scheduler;
mod signals;
mod trainer;
mod types;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::rest::ApiState;
use crate::config::ServiceSettings;
use crate::registry::AgentRegistry;
use crate::scheduler::TraderScheduler;
use crate::trainer::AgentTrainer;

/// Delay before resume-on-boot queries the backend, giving it time to come
/// up alongside this service.
const RESUME_DELAY_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian RL Trading Service — Starting Up        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = ServiceSettings::from_env();
    settings.ensure_dirs()?;
    info!(
        backend = %settings.backend_url,
        ml_service = %settings.ml_service_url,
        use_cuda = settings.use_cuda,
        "service configured"
    );

    // ── 2. Registry, trainer, scheduler ──────────────────────────────────
    let registry = Arc::new(AgentRegistry::new(
        settings.model_dir.clone(),
        settings.checkpoint_dir.clone(),
    ));
    info!(agents = registry.list().len(), "agent registry loaded");

    let trainer = Arc::new(AgentTrainer::new(settings.clone(), registry.clone()));
    let scheduler = Arc::new(TraderScheduler::new(settings.clone(), trainer.clone()));

    // ── 3. Resume traders that were running before restart ──────────────
    let resume_scheduler = scheduler.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(RESUME_DELAY_SECS)).await;
        resume_scheduler.resume_running_traders().await;
    });

    // ── 4. REST API ──────────────────────────────────────────────────────
    let api_state = ApiState {
        registry: registry.clone(),
        trainer: trainer.clone(),
        scheduler: scheduler.clone(),
    };
    let bind_addr = settings.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping traders");
    scheduler.shutdown().await;
    info!("Meridian shut down complete.");
    Ok(())
}
