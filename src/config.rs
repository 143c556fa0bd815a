// =============================================================================
// Service Settings — environment-driven configuration
// =============================================================================
//
// Central configuration for the Meridian RL trading service. Every value has
// a default so the binary runs with no environment at all; docker-compose
// overrides the paths and URLs in deployment.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

/// Application settings resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Directory holding one subdirectory per trained agent.
    pub model_dir: PathBuf,
    /// Directory for mid-training checkpoints.
    pub checkpoint_dir: PathBuf,

    // --- Training defaults ---------------------------------------------------
    pub default_timesteps: usize,
    pub default_learning_rate: f64,
    pub default_batch_size: usize,
    pub default_n_steps: usize,

    // --- Environment defaults ------------------------------------------------
    pub default_lookback_window: usize,
    pub default_initial_balance: f64,

    /// Prefer CUDA when available.
    pub use_cuda: bool,

    /// URL of the price-forecast ML service.
    pub ml_service_url: String,
    /// URL of the main backend (portfolio, execution, market data).
    pub backend_url: String,

    /// Bind address for the REST API.
    pub bind_addr: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models"),
            checkpoint_dir: PathBuf::from("./checkpoints"),
            default_timesteps: 100_000,
            default_learning_rate: 0.0003,
            default_batch_size: 64,
            default_n_steps: 2048,
            default_lookback_window: 60,
            default_initial_balance: 100_000.0,
            use_cuda: true,
            ml_service_url: "http://ml-service:8000".to_string(),
            backend_url: "http://backend:3001".to_string(),
            bind_addr: "0.0.0.0:8001".to_string(),
        }
    }
}

impl ServiceSettings {
    /// Read settings from the process environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            model_dir: std::env::var("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.model_dir),
            checkpoint_dir: std::env::var("CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.checkpoint_dir),
            default_timesteps: env_or("DEFAULT_TIMESTEPS", d.default_timesteps),
            default_learning_rate: env_or("DEFAULT_LEARNING_RATE", d.default_learning_rate),
            default_batch_size: env_or("DEFAULT_BATCH_SIZE", d.default_batch_size),
            default_n_steps: env_or("DEFAULT_N_STEPS", d.default_n_steps),
            default_lookback_window: env_or("DEFAULT_LOOKBACK_WINDOW", d.default_lookback_window),
            default_initial_balance: env_or("DEFAULT_INITIAL_BALANCE", d.default_initial_balance),
            use_cuda: std::env::var("USE_CUDA")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(d.use_cuda),
            ml_service_url: std::env::var("ML_SERVICE_URL").unwrap_or(d.ml_service_url),
            backend_url: std::env::var("BACKEND_URL").unwrap_or(d.backend_url),
            bind_addr: std::env::var("MERIDIAN_BIND_ADDR").unwrap_or(d.bind_addr),
        }
    }

    /// Create the model and checkpoint directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.model_dir).with_context(|| {
            format!("failed to create model dir {}", self.model_dir.display())
        })?;
        std::fs::create_dir_all(&self.checkpoint_dir).with_context(|| {
            format!(
                "failed to create checkpoint dir {}",
                self.checkpoint_dir.display()
            )
        })?;
        info!(
            model_dir = %self.model_dir.display(),
            checkpoint_dir = %self.checkpoint_dir.display(),
            "storage directories ready"
        );
        Ok(())
    }

    /// Compute device for training/inference.
    pub fn device(&self) -> candle_core::Device {
        if self.use_cuda {
            if let Ok(dev) = candle_core::Device::cuda_if_available(0) {
                return dev;
            }
        }
        candle_core::Device::Cpu
    }
}
