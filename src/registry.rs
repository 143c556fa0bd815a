// =============================================================================
// Agent Registry — persisted policies, metadata and in-memory status
// =============================================================================
//
// On startup the registry scans the model directory for subdirectories
// containing a policy artifact plus `metadata.json` and builds the status
// table. Training sessions update it; delete purges weights, normaliser,
// checkpoints and cache entries.
//
// Layout per agent name:
//   <model_dir>/<name>/model.safetensors
//   <model_dir>/<name>/vec_normalize.json
//   <model_dir>/<name>/metadata.json
//   <checkpoint_dir>/<name>/checkpoint_<steps>.safetensors
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent_config::{preset_agent_configs, AgentConfig};

pub const MODEL_FILE: &str = "model.safetensors";
pub const NORMALIZER_FILE: &str = "vec_normalize.json";
pub const METADATA_FILE: &str = "metadata.json";

/// Maximum training-log lines retained per agent.
const MAX_LOG_LINES: usize = 500;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Training,
    Trained,
    Failed,
}

/// Evaluation metrics of one training session. All values pass through the
/// finite-sanitiser before landing here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub mean_reward: Option<f64>,
    pub std_reward: Option<f64>,
    pub mean_length: Option<f64>,
    pub mean_return_pct: Option<f64>,
    pub max_return_pct: Option<f64>,
    pub min_return_pct: Option<f64>,
    pub mean_sharpe_ratio: Option<f64>,
    pub mean_sortino_ratio: Option<f64>,
    pub mean_max_drawdown: Option<f64>,
    pub worst_max_drawdown: Option<f64>,
    pub mean_win_rate: Option<f64>,
    pub mean_profit_factor: Option<f64>,
    pub mean_alpha_pct: Option<f64>,
}

/// Chronological train/test proportions of the walk-forward split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardSplit {
    pub train_pct: u8,
    pub test_pct: u8,
}

impl Default for WalkForwardSplit {
    fn default() -> Self {
        Self {
            train_pct: 80,
            test_pct: 20,
        }
    }
}

/// The `metadata.json` persisted next to every policy artifact. The embedded
/// `config` is authoritative for policy architecture on continue-training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub agent_name: String,
    pub config: AgentConfig,
    pub trained_at: String,
    pub training_duration_seconds: f64,
    /// Timesteps of this session only.
    pub total_timesteps: usize,
    /// Episodes of this session only.
    pub total_episodes: usize,
    /// Monotonic counters across all sessions on this agent name.
    pub cumulative_timesteps: usize,
    pub cumulative_episodes: usize,
    pub training_sessions: u32,
    pub continued_from_previous: bool,
    pub best_reward: Option<f64>,
    pub device: String,
    pub performance_metrics: Option<EvalMetrics>,
    pub oos_performance_metrics: Option<EvalMetrics>,
    #[serde(default)]
    pub walk_forward_split: WalkForwardSplit,
    #[serde(default)]
    pub symbols_trained: Vec<String>,
}

/// In-memory status row for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusInfo {
    pub name: String,
    pub status: AgentState,
    pub is_trained: bool,
    pub training_progress: f64,
    pub last_trained: Option<String>,
    pub total_episodes: usize,
    pub best_reward: Option<f64>,
    pub config: Option<AgentConfig>,
    pub performance_metrics: Option<EvalMetrics>,
}

/// One line of the per-agent training log ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingLogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Process-wide registry of trained agents.
pub struct AgentRegistry {
    model_dir: PathBuf,
    checkpoint_dir: PathBuf,
    statuses: RwLock<HashMap<String, AgentStatusInfo>>,
    logs: RwLock<HashMap<String, VecDeque<TrainingLogEntry>>>,
}

impl AgentRegistry {
    /// Build the registry and scan the model directory for existing agents.
    pub fn new(model_dir: PathBuf, checkpoint_dir: PathBuf) -> Self {
        let registry = Self {
            model_dir,
            checkpoint_dir,
            statuses: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
        };
        registry.scan_existing();
        registry
    }

    fn scan_existing(&self) {
        let entries = match std::fs::read_dir(&self.model_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !path.join(MODEL_FILE).exists() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            match self.load_metadata(&name) {
                Ok(Some(metadata)) => {
                    info!(agent = %name, sessions = metadata.training_sessions, "found existing model");
                    self.statuses.write().insert(
                        name.clone(),
                        AgentStatusInfo {
                            name: name.clone(),
                            status: AgentState::Trained,
                            is_trained: true,
                            training_progress: 1.0,
                            last_trained: Some(metadata.trained_at.clone()),
                            total_episodes: metadata.cumulative_episodes,
                            best_reward: metadata.best_reward,
                            config: Some(metadata.config.clone()),
                            performance_metrics: metadata.performance_metrics.clone(),
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    // Treated as no prior state; the artifact stays on disk.
                    warn!(agent = %name, error = %e, "failed to load agent metadata");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------------

    pub fn agent_dir(&self, name: &str) -> PathBuf {
        self.model_dir.join(name)
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join(MODEL_FILE)
    }

    pub fn normalizer_path(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join(NORMALIZER_FILE)
    }

    pub fn metadata_path(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join(METADATA_FILE)
    }

    pub fn checkpoint_dir_for(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(name)
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.model_path(name).exists()
    }

    // -------------------------------------------------------------------------
    // Metadata persistence
    // -------------------------------------------------------------------------

    pub fn load_metadata(&self, name: &str) -> Result<Option<AgentMetadata>> {
        let path = self.metadata_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let metadata: AgentMetadata = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(metadata))
    }

    pub fn save_metadata(&self, metadata: &AgentMetadata) -> Result<()> {
        let dir = self.agent_dir(&metadata.agent_name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = self.metadata_path(&metadata.agent_name);
        let json = serde_json::to_string_pretty(metadata).context("failed to serialise metadata")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Status table
    // -------------------------------------------------------------------------

    pub fn status(&self, name: &str) -> Option<AgentStatusInfo> {
        self.statuses.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<AgentStatusInfo> {
        let mut all: Vec<AgentStatusInfo> = self.statuses.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn is_trained(&self, name: &str) -> bool {
        self.statuses
            .read()
            .get(name)
            .map(|s| s.is_trained)
            .unwrap_or(false)
    }

    pub fn mark_training(&self, name: &str, config: &AgentConfig) {
        self.statuses.write().insert(
            name.to_string(),
            AgentStatusInfo {
                name: name.to_string(),
                status: AgentState::Training,
                is_trained: false,
                training_progress: 0.0,
                last_trained: None,
                total_episodes: 0,
                best_reward: None,
                config: Some(config.clone()),
                performance_metrics: None,
            },
        );
    }

    pub fn update_progress(&self, name: &str, progress: f64) {
        if let Some(status) = self.statuses.write().get_mut(name) {
            status.training_progress = progress;
        }
    }

    pub fn mark_trained(&self, metadata: &AgentMetadata) {
        self.statuses.write().insert(
            metadata.agent_name.clone(),
            AgentStatusInfo {
                name: metadata.agent_name.clone(),
                status: AgentState::Trained,
                is_trained: true,
                training_progress: 1.0,
                last_trained: Some(metadata.trained_at.clone()),
                total_episodes: metadata.cumulative_episodes,
                best_reward: metadata.best_reward,
                config: Some(metadata.config.clone()),
                performance_metrics: metadata.performance_metrics.clone(),
            },
        );
    }

    pub fn mark_failed(&self, name: &str, config: &AgentConfig) {
        self.statuses.write().insert(
            name.to_string(),
            AgentStatusInfo {
                name: name.to_string(),
                status: AgentState::Failed,
                is_trained: false,
                training_progress: 0.0,
                last_trained: None,
                total_episodes: 0,
                best_reward: None,
                config: Some(config.clone()),
                performance_metrics: None,
            },
        );
    }

    // -------------------------------------------------------------------------
    // Training logs
    // -------------------------------------------------------------------------

    pub fn add_log(&self, name: &str, level: &str, message: impl Into<String>) {
        let mut logs = self.logs.write();
        let buffer = logs.entry(name.to_string()).or_default();
        buffer.push_back(TrainingLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.into(),
        });
        while buffer.len() > MAX_LOG_LINES {
            buffer.pop_front();
        }
    }

    pub fn logs(&self, name: &str) -> Vec<TrainingLogEntry> {
        self.logs
            .read()
            .get(name)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_logs(&self, name: &str) {
        if let Some(buffer) = self.logs.write().get_mut(name) {
            buffer.clear();
        }
    }

    // -------------------------------------------------------------------------
    // Presets & delete
    // -------------------------------------------------------------------------

    pub fn presets(&self) -> Vec<AgentConfig> {
        preset_agent_configs()
    }

    /// Remove an agent completely: weights, normaliser, metadata,
    /// checkpoints and all in-memory entries.
    pub fn delete(&self, name: &str) -> bool {
        self.statuses.write().remove(name);
        self.logs.write().remove(name);

        let mut ok = true;
        for dir in [self.agent_dir(name), self.checkpoint_dir_for(name)] {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(agent = %name, path = %dir.display(), error = %e, "failed to purge agent directory");
                    ok = false;
                }
            }
        }
        ok
    }
}

/// Convert non-finite floats to `None` so they never reach a JSON payload.
pub fn sanitize(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Write a checkpoint file name for the given cumulative step count.
pub fn checkpoint_file(dir: &Path, steps: usize) -> PathBuf {
    dir.join(format!("checkpoint_{steps}.safetensors"))
}
