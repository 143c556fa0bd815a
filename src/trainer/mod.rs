// =============================================================================
// Agent Trainer — PPO training sessions with resumable normalisation
// =============================================================================
//
// A training session:
//   1. Walk-forward 80/20 split per symbol (chronological).
//   2. One environment per qualifying symbol, stepped as a vec-env with
//      observation and reward normalisation.
//   3. continue_training: load prior weights + normaliser statistics; the
//      PERSISTED config is authoritative for architecture, only trading
//      fields come from the new request.
//   4. PPO with cosine LR annealing and the three-phase curriculum; progress
//      emitted at rollout boundaries; checkpoints every tenth of the session.
//   5. In-sample eval (10 deterministic episodes) and out-of-sample eval on
//      the held-out tail with FROZEN normalisation statistics (5 episodes).
//   6. Metadata saved with monotonic cumulative counters.
//
// The learn loop is CPU-bound and runs on a blocking thread so trader loops
// keep ticking during training.
// =============================================================================

pub mod callbacks;
pub mod signal;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent_config::AgentConfig;
use crate::config::ServiceSettings;
use crate::env::{Action, EnvError, EnvOptions, TradingEnv, VecEnv};
use crate::indicators::FeatureFrame;
use crate::policy::{
    cosine_lr_schedule, ObsNormalizer, PolicyArch, Ppo, PpoParams, PpoPolicy,
};
use crate::registry::{
    checkpoint_file, sanitize, AgentMetadata, AgentRegistry, EvalMetrics, WalkForwardSplit,
};
use callbacks::{CurriculumCallback, ProgressTracker, ProgressUpdate};

pub use callbacks::PhaseMultipliers;
pub use signal::{BacktestReport, TradingSignal};

/// Callback invoked with progress updates during training.
pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("no valid training data provided")]
    NoTrainingData,
    #[error("training already in progress for agent {0}")]
    AlreadyTraining(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Cached read-only policy for inference, tied to the env dimensions it was
/// built for.
pub(crate) struct CachedPolicy {
    pub policy: PpoPolicy,
    pub config: AgentConfig,
    pub window_size: usize,
}

/// Manages training and inference for all agents.
pub struct AgentTrainer {
    settings: ServiceSettings,
    registry: Arc<AgentRegistry>,
    /// Names with a training session in flight; one per agent, enforced.
    active: Mutex<HashSet<String>>,
    /// Inference cache; invalidated after every training session.
    pub(crate) policies: RwLock<HashMap<String, Arc<CachedPolicy>>>,
}

impl AgentTrainer {
    pub fn new(settings: ServiceSettings, registry: Arc<AgentRegistry>) -> Self {
        Self {
            settings,
            registry,
            active: Mutex::new(HashSet::new()),
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// True while a session for this agent is running.
    pub fn is_training(&self, agent_name: &str) -> bool {
        self.active.lock().contains(agent_name)
    }

    /// Train (or continue training) an agent on a blocking thread.
    ///
    /// Fails fast with [`TrainError::AlreadyTraining`] when a session for
    /// the same name is in flight.
    pub async fn train_agent(
        self: &Arc<Self>,
        agent_name: &str,
        config: AgentConfig,
        training_data: HashMap<String, FeatureFrame>,
        total_timesteps: usize,
        continue_training: bool,
        progress: Option<ProgressFn>,
    ) -> Result<AgentMetadata, TrainError> {
        {
            let mut active = self.active.lock();
            if !active.insert(agent_name.to_string()) {
                return Err(TrainError::AlreadyTraining(agent_name.to_string()));
            }
        }

        let trainer = self.clone();
        let name = agent_name.to_string();
        let result = tokio::task::spawn_blocking(move || {
            trainer.train_agent_sync(
                &name,
                config,
                training_data,
                total_timesteps,
                continue_training,
                progress,
            )
        })
        .await
        .map_err(|e| TrainError::Other(anyhow!("training task panicked: {e}")));

        self.active.lock().remove(agent_name);
        result?
    }

    /// Synchronous training implementation.
    pub fn train_agent_sync(
        &self,
        agent_name: &str,
        config: AgentConfig,
        training_data: HashMap<String, FeatureFrame>,
        total_timesteps: usize,
        continue_training: bool,
        progress: Option<ProgressFn>,
    ) -> Result<AgentMetadata, TrainError> {
        let started = std::time::Instant::now();
        self.registry.mark_training(agent_name, &config);
        self.registry.clear_logs(agent_name);

        let result = self.run_session(
            agent_name,
            &config,
            training_data,
            total_timesteps,
            continue_training,
            progress,
        );

        match &result {
            Ok(metadata) => {
                self.registry.mark_trained(metadata);
                self.policies.write().remove(agent_name);
                info!(
                    agent = %agent_name,
                    duration_s = started.elapsed().as_secs_f64(),
                    cumulative_timesteps = metadata.cumulative_timesteps,
                    sessions = metadata.training_sessions,
                    "training completed"
                );
            }
            Err(e) => {
                self.registry.mark_failed(agent_name, &config);
                self.registry
                    .add_log(agent_name, "error", format!("training failed: {e}"));
                warn!(agent = %agent_name, error = %e, "training failed");
            }
        }
        result
    }

    fn run_session(
        &self,
        agent_name: &str,
        config: &AgentConfig,
        training_data: HashMap<String, FeatureFrame>,
        total_timesteps: usize,
        continue_training: bool,
        progress: Option<ProgressFn>,
    ) -> Result<AgentMetadata, TrainError> {
        let log = |level: &str, msg: String| {
            self.registry.add_log(agent_name, level, msg);
        };
        let session_start = Utc::now();
        let wall_clock = std::time::Instant::now();

        // --- Prior state for continue-training -------------------------------
        let has_existing_model = self.registry.has_model(agent_name);
        let mut will_continue = continue_training && has_existing_model;

        let mut cumulative_timesteps = 0usize;
        let mut cumulative_episodes = 0usize;
        let mut training_sessions = 0u32;
        let mut saved_config: Option<AgentConfig> = None;

        if will_continue {
            match self.registry.load_metadata(agent_name) {
                Ok(Some(metadata)) => {
                    cumulative_timesteps = metadata.cumulative_timesteps;
                    cumulative_episodes = metadata.cumulative_episodes;
                    training_sessions = metadata.training_sessions;
                    log(
                        "info",
                        format!(
                            "found existing model with {} cumulative timesteps, preserving architecture (transformer={})",
                            cumulative_timesteps, metadata.config.use_transformer_policy
                        ),
                    );
                    saved_config = Some(metadata.config);
                }
                Ok(None) => {}
                Err(e) => {
                    log("warning", format!("could not load existing metadata: {e}"));
                }
            }
        }

        // The persisted config wins on architecture; the incoming config may
        // only adjust trading fields.
        let effective_config = match (&saved_config, will_continue) {
            (Some(saved), true) => saved.with_trading_fields_from(config),
            _ => config.clone(),
        };

        // --- Walk-forward split per symbol ------------------------------------
        let mut train_split: Vec<(String, FeatureFrame)> = Vec::new();
        let mut test_split: Vec<(String, FeatureFrame)> = Vec::new();

        let mut symbols: Vec<&String> = training_data.keys().collect();
        symbols.sort();
        for symbol in symbols {
            let frame = &training_data[symbol];
            if frame.len() < 200 {
                log(
                    "warning",
                    format!("skipping {symbol}: insufficient data ({} rows)", frame.len()),
                );
                continue;
            }
            let split_idx = (frame.len() as f64 * 0.8) as usize;
            let train_frame = frame.slice_rows(0, split_idx);
            let test_frame = frame.slice_rows(split_idx, frame.len());

            if train_frame.len() < 150 {
                log(
                    "warning",
                    format!(
                        "skipping {symbol}: train split too small ({} rows)",
                        train_frame.len()
                    ),
                );
                continue;
            }
            if test_frame.len() < 100 {
                log(
                    "warning",
                    format!(
                        "{symbol}: test split too small ({}), using full data for training",
                        test_frame.len()
                    ),
                );
                train_split.push((symbol.clone(), frame.clone()));
            } else {
                log(
                    "info",
                    format!(
                        "{symbol}: {} rows -> train {}, test {} (walk-forward 80/20)",
                        frame.len(),
                        train_frame.len(),
                        test_frame.len()
                    ),
                );
                train_split.push((symbol.clone(), train_frame));
                test_split.push((symbol.clone(), test_frame));
            }
        }

        if train_split.is_empty() {
            return Err(TrainError::NoTrainingData);
        }

        // --- Environments -----------------------------------------------------
        let window = effective_config
            .lookback_window
            .unwrap_or(self.settings.default_lookback_window);
        let mut envs = Vec::new();
        for (i, (symbol, frame)) in train_split.iter().enumerate() {
            let env = TradingEnv::new(
                frame.clone(),
                &effective_config,
                window,
                EnvOptions {
                    seed: Some(1000 + i as u64),
                    ..Default::default()
                },
            )?;
            log("info", format!("environment ready for {symbol}"));
            envs.push(env);
        }
        let mut vec_env = VecEnv::new(envs);
        let obs_dim = vec_env.observation_dim();
        let n_actions = vec_env.action_count();
        let n_features = obs_dim.saturating_sub(crate::env::N_PORTFOLIO_FEATURES) / window;

        // --- Normaliser (resume statistics when continuing) -------------------
        let norm_path = self.registry.normalizer_path(agent_name);
        let mut normalizer = if will_continue && norm_path.exists() {
            match ObsNormalizer::load(&norm_path) {
                Ok(mut loaded) if loaded.obs_dim() == obs_dim => {
                    log("info", "loaded normalisation statistics".to_string());
                    loaded.resize_envs(vec_env.len());
                    loaded.training = true;
                    loaded.norm_reward = true;
                    loaded
                }
                Ok(_) => {
                    log(
                        "warning",
                        "normaliser dimensions changed, starting fresh statistics".to_string(),
                    );
                    ObsNormalizer::new(obs_dim, vec_env.len(), effective_config.gamma)
                }
                Err(e) => {
                    log("warning", format!("failed to load normaliser: {e}"));
                    ObsNormalizer::new(obs_dim, vec_env.len(), effective_config.gamma)
                }
            }
        } else {
            ObsNormalizer::new(obs_dim, vec_env.len(), effective_config.gamma)
        };

        // --- Policy -----------------------------------------------------------
        let device = self.settings.device();
        let arch = PolicyArch::from_config(&effective_config, window, n_features);
        if let PolicyArch::Transformer(shape) = &arch {
            log(
                "info",
                format!(
                    "building PPO with transformer extractor (d_model={}, heads={}, layers={}, d_ff={})",
                    shape.d_model, shape.n_heads, shape.n_layers, shape.d_ff
                ),
            );
        } else {
            log("info", "building PPO with MLP [256, 256]".to_string());
        }
        let mut policy = PpoPolicy::new(obs_dim, n_actions, arch, device)
            .context("failed to build policy")?;

        if will_continue {
            match policy.load(&self.registry.model_path(agent_name)) {
                Ok(()) => {
                    log(
                        "info",
                        format!("continuing from {cumulative_timesteps} previous timesteps"),
                    );
                }
                Err(e) => {
                    // Missing/incompatible artifact: fall back to fresh training.
                    log(
                        "warning",
                        format!("failed to load existing model ({e}), training from scratch"),
                    );
                    will_continue = false;
                    cumulative_timesteps = 0;
                    cumulative_episodes = 0;
                    training_sessions = 0;
                    normalizer = ObsNormalizer::new(obs_dim, vec_env.len(), effective_config.gamma);
                }
            }
        }

        let params = PpoParams::from_config(
            &effective_config,
            self.settings.default_n_steps.min(total_timesteps.max(64)),
            self.settings.default_batch_size,
        );
        let mut ppo = Ppo::new(policy, params, 7).context("failed to build PPO")?;
        // Continue-training must not reset the global step counter.
        ppo.num_timesteps = cumulative_timesteps;
        let start_timesteps = ppo.num_timesteps;

        // --- Learn loop -------------------------------------------------------
        let mut tracker = ProgressTracker::new(agent_name, total_timesteps, start_timesteps);
        let mut curriculum = CurriculumCallback::new(vec_env.envs_mut()[0].weights.clone());
        let lr_schedule = cosine_lr_schedule(effective_config.learning_rate);

        let checkpoint_dir = self.registry.checkpoint_dir_for(agent_name);
        std::fs::create_dir_all(&checkpoint_dir)
            .with_context(|| format!("failed to create {}", checkpoint_dir.display()))?;
        let checkpoint_every = (total_timesteps / 10).max(1);
        let mut next_checkpoint = checkpoint_every;

        let raw = vec_env.reset_all();
        let mut last_obs: Vec<Vec<f32>> =
            raw.iter().map(|o| normalizer.normalize_obs(o)).collect();

        log(
            "info",
            format!(
                "starting {} for {} timesteps",
                if will_continue { "continue training" } else { "fresh training" },
                total_timesteps
            ),
        );

        while tracker.session_timesteps(ppo.num_timesteps) < total_timesteps {
            let session_progress = tracker.progress(ppo.num_timesteps);
            ppo.set_learning_rate(lr_schedule(1.0 - session_progress));
            if let Some(phase) = curriculum.maybe_advance(session_progress, &mut vec_env) {
                log("info", format!("curriculum entering {phase}"));
            }

            let stats = ppo.collect_and_update(&mut vec_env, &mut normalizer, &mut last_obs)?;
            let update = tracker.on_rollout(&stats, ppo.num_timesteps);
            self.registry.update_progress(agent_name, update.progress);
            if let Some(cb) = &progress {
                cb(update);
            }

            let session_steps = tracker.session_timesteps(ppo.num_timesteps);
            if session_steps >= next_checkpoint {
                let path = checkpoint_file(&checkpoint_dir, ppo.num_timesteps);
                if let Err(e) = ppo.policy.save(&path) {
                    log("warning", format!("checkpoint save failed: {e}"));
                }
                while next_checkpoint <= session_steps {
                    next_checkpoint += checkpoint_every;
                }
            }
        }

        // --- Persist policy + normaliser --------------------------------------
        let agent_dir = self.registry.agent_dir(agent_name);
        std::fs::create_dir_all(&agent_dir)
            .with_context(|| format!("failed to create {}", agent_dir.display()))?;
        ppo.policy.save(&self.registry.model_path(agent_name))?;
        normalizer.save(&norm_path)?;

        // --- In-sample evaluation ---------------------------------------------
        log("info", "evaluating model performance (in-sample)".to_string());
        let mut frozen = normalizer.clone();
        frozen.eval_mode();
        let eval_results = evaluate(&ppo.policy, vec_env.envs_mut(), &frozen, 10);
        log(
            "info",
            format!(
                "in-sample mean return {:.2}%",
                eval_results.mean_return_pct.unwrap_or(0.0)
            ),
        );

        // --- Out-of-sample evaluation (frozen statistics) ---------------------
        let mut oos_results = None;
        if let Some((test_symbol, test_frame)) = test_split.first() {
            log(
                "info",
                format!("out-of-sample evaluation on {test_symbol}"),
            );
            match TradingEnv::new(
                test_frame.clone(),
                &effective_config,
                window,
                EnvOptions {
                    seed: Some(99),
                    ..Default::default()
                },
            ) {
                Ok(mut test_env) => {
                    let oos = evaluate(
                        &ppo.policy,
                        std::slice::from_mut(&mut test_env),
                        &frozen,
                        5,
                    );
                    let is_return = eval_results.mean_return_pct.unwrap_or(0.0);
                    let oos_return = oos.mean_return_pct.unwrap_or(0.0);
                    if is_return > 0.0 && oos_return < -is_return.abs() * 0.5 {
                        log(
                            "warning",
                            format!(
                                "OVERFITTING WARNING: in-sample {is_return:.2}% vs OOS {oos_return:.2}%"
                            ),
                        );
                    }
                    oos_results = Some(oos);
                }
                Err(e) => {
                    log("warning", format!("OOS evaluation failed: {e}"));
                }
            }
        }

        // --- Metadata with cumulative tracking --------------------------------
        let session_episodes = tracker.episodes();
        let metadata = AgentMetadata {
            agent_name: agent_name.to_string(),
            // effective_config preserves architecture for the next session.
            config: effective_config,
            trained_at: session_start.to_rfc3339(),
            training_duration_seconds: wall_clock.elapsed().as_secs_f64(),
            total_timesteps,
            total_episodes: session_episodes,
            cumulative_timesteps: cumulative_timesteps + total_timesteps,
            cumulative_episodes: cumulative_episodes + session_episodes,
            training_sessions: training_sessions + 1,
            continued_from_previous: will_continue,
            best_reward: tracker.best_reward.and_then(sanitize),
            device: if self.settings.use_cuda { "cuda" } else { "cpu" }.to_string(),
            performance_metrics: Some(eval_results),
            oos_performance_metrics: oos_results,
            walk_forward_split: WalkForwardSplit::default(),
            symbols_trained: training_data.keys().cloned().collect(),
        };
        self.registry.save_metadata(&metadata)?;

        Ok(metadata)
    }

    /// Remove an agent and evict its cached policy.
    pub fn delete_agent(&self, agent_name: &str) -> bool {
        self.policies.write().remove(agent_name);
        self.registry.delete(agent_name)
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Run deterministic evaluation episodes, rotating over the given
/// environments, with frozen normalisation statistics. Episode `i` reseeds
/// its environment with `42 + i` so results are reproducible.
fn evaluate(
    policy: &PpoPolicy,
    envs: &mut [TradingEnv],
    frozen: &ObsNormalizer,
    n_episodes: usize,
) -> EvalMetrics {
    let mut rng = StdRng::seed_from_u64(0);
    let mut rewards = Vec::new();
    let mut lengths = Vec::new();
    let mut returns = Vec::new();
    let mut sharpes = Vec::new();
    let mut sortinos = Vec::new();
    let mut drawdowns = Vec::new();
    let mut win_rates = Vec::new();
    let mut profit_factors = Vec::new();
    let mut alphas = Vec::new();

    for i in 0..n_episodes {
        let env = &mut envs[i % envs.len()];
        env.reseed(42 + i as u64);
        let mut obs = env.reset(true);
        let mut total_reward = 0.0;
        let mut length = 0usize;

        loop {
            let normalized = frozen.apply_obs(&obs);
            let action_idx = match policy.predict(&normalized, true, &mut rng) {
                Ok(a) => a,
                Err(_) => 0,
            };
            let action =
                Action::from_index(action_idx, env.shorts_enabled()).unwrap_or(Action::Hold);
            let result = env.step(action);
            total_reward += result.reward;
            length += 1;
            obs = result.observation;

            if result.terminated {
                let info = result.info;
                returns.push(info.return_pct);
                sharpes.push(info.sharpe_ratio);
                sortinos.push(info.sortino_ratio);
                drawdowns.push(info.max_drawdown);
                win_rates.push(info.win_rate);
                profit_factors.push(info.profit_factor);
                alphas.push(info.alpha_pct);
                break;
            }
        }

        rewards.push(total_reward);
        lengths.push(length as f64);
    }

    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len().max(1) as f64;
    let std = |v: &[f64]| {
        let m = mean(v);
        (v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / v.len().max(1) as f64).sqrt()
    };
    // Exclude inf-like profit factors from the mean.
    let pf: Vec<f64> = profit_factors.iter().copied().filter(|&x| x < 900.0).collect();

    EvalMetrics {
        mean_reward: sanitize(mean(&rewards)),
        std_reward: sanitize(std(&rewards)),
        mean_length: sanitize(mean(&lengths)),
        mean_return_pct: sanitize(mean(&returns)),
        max_return_pct: returns.iter().copied().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        }),
        min_return_pct: returns.iter().copied().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.min(v)))
        }),
        mean_sharpe_ratio: sanitize(mean(&sharpes)),
        mean_sortino_ratio: sanitize(mean(&sortinos)),
        mean_max_drawdown: sanitize(mean(&drawdowns)),
        worst_max_drawdown: drawdowns.iter().copied().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        }),
        mean_win_rate: sanitize(mean(&win_rates)),
        mean_profit_factor: if pf.is_empty() {
            Some(0.0)
        } else {
            sanitize(mean(&pf))
        },
        mean_alpha_pct: sanitize(mean(&alphas)),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::calculate_indicators;
    use crate::types::Bar;

    fn synthetic_frame(n: usize, seed_phase: f64) -> FeatureFrame {
        let bars: Vec<Bar> = (0..n)
            .map(|i| {
                let base = 100.0 + ((i as f64 + seed_phase) * 0.13).sin() * 3.0 + i as f64 * 0.01;
                Bar {
                    timestamp: 86_400_000 * i as i64,
                    open: base,
                    high: base * 1.01,
                    low: base * 0.99,
                    close: base,
                    volume: 1e6,
                }
            })
            .collect();
        calculate_indicators(&bars).unwrap()
    }

    fn test_trainer() -> (tempfile::TempDir, Arc<AgentTrainer>) {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = ServiceSettings::default();
        settings.model_dir = tmp.path().join("models");
        settings.checkpoint_dir = tmp.path().join("checkpoints");
        settings.use_cuda = false;
        settings.default_lookback_window = 10;
        settings.default_n_steps = 32;
        settings.default_batch_size = 32;
        settings.ensure_dirs().unwrap();
        let registry = Arc::new(AgentRegistry::new(
            settings.model_dir.clone(),
            settings.checkpoint_dir.clone(),
        ));
        let trainer = Arc::new(AgentTrainer::new(settings, registry));
        (tmp, trainer)
    }

    fn small_config(name: &str) -> AgentConfig {
        let mut config = AgentConfig::named(name);
        config.lookback_window = Some(10);
        config
    }

    #[test]
    fn training_produces_artifacts_and_metadata() {
        let (_tmp, trainer) = test_trainer();
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), synthetic_frame(320, 0.0));

        let metadata = trainer
            .train_agent_sync("alpha", small_config("alpha"), data, 64, false, None)
            .unwrap();

        assert_eq!(metadata.training_sessions, 1);
        assert!(!metadata.continued_from_previous);
        assert_eq!(metadata.cumulative_timesteps, 64);
        assert!(trainer.registry().has_model("alpha"));
        assert!(trainer.registry().normalizer_path("alpha").exists());
        assert!(metadata.performance_metrics.is_some());
        let status = trainer.registry().status("alpha").unwrap();
        assert!(status.is_trained);
    }

    #[test]
    fn continue_training_accumulates_counters_and_preserves_architecture() {
        let (_tmp, trainer) = test_trainer();
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), synthetic_frame(320, 0.0));

        let mut first_config = small_config("beta");
        first_config.use_transformer_policy = true;
        first_config.transformer_d_model = 32;
        first_config.transformer_n_heads = 4;
        first_config.transformer_n_layers = 1;
        first_config.transformer_d_ff = 64;

        let first = trainer
            .train_agent_sync("beta", first_config, data.clone(), 64, false, None)
            .unwrap();
        assert_eq!(first.cumulative_timesteps, 64);

        // Second session tries to flip the architecture and raise the budget.
        let mut second_config = small_config("beta");
        second_config.use_transformer_policy = false;
        second_config.transformer_d_model = 256;
        second_config.initial_balance = 200_000.0;

        let second = trainer
            .train_agent_sync("beta", second_config, data, 64, true, None)
            .unwrap();

        assert!(second.continued_from_previous);
        assert_eq!(second.training_sessions, 2);
        assert_eq!(second.cumulative_timesteps, 128);
        assert!(second.cumulative_timesteps >= first.cumulative_timesteps);
        // Architecture preserved from the first session.
        assert!(second.config.use_transformer_policy);
        assert_eq!(second.config.transformer_d_model, 32);
        // Trading field updated.
        assert!((second.config.initial_balance - 200_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_frames_below_minimum_rows() {
        let (_tmp, trainer) = test_trainer();
        let mut data = HashMap::new();
        data.insert("TINY".to_string(), synthetic_frame(150, 0.0));

        let err = trainer
            .train_agent_sync("gamma", small_config("gamma"), data, 64, false, None)
            .unwrap_err();
        assert!(matches!(err, TrainError::NoTrainingData));
        let status = trainer.registry().status("gamma").unwrap();
        assert_eq!(status.status, crate::registry::AgentState::Failed);
    }

    #[test]
    fn duplicate_training_fails_fast() {
        let (_tmp, trainer) = test_trainer();
        trainer.active.lock().insert("delta".to_string());
        assert!(trainer.is_training("delta"));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(trainer.train_agent(
                "delta",
                small_config("delta"),
                HashMap::new(),
                64,
                false,
                None,
            ))
            .unwrap_err();
        assert!(matches!(err, TrainError::AlreadyTraining(_)));
    }

    #[test]
    fn progress_callback_reports_session_progress() {
        let (_tmp, trainer) = test_trainer();
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), synthetic_frame(320, 1.0));

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let progress: ProgressFn = Arc::new(move |u| sink.lock().push(u));

        trainer
            .train_agent_sync("eps", small_config("eps"), data, 64, false, Some(progress))
            .unwrap();

        let collected = updates.lock();
        assert!(!collected.is_empty());
        let last = collected.last().unwrap();
        assert!((last.progress - 1.0).abs() < 1e-9);
        assert_eq!(last.total_timesteps, 64);
        for u in collected.iter() {
            if let Some(r) = u.mean_reward {
                assert!(r.is_finite());
            }
        }
    }

    #[test]
    fn evaluation_is_reproducible_with_frozen_stats() {
        let (_tmp, trainer) = test_trainer();
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), synthetic_frame(320, 2.0));
        trainer
            .train_agent_sync("zeta", small_config("zeta"), data, 64, false, None)
            .unwrap();

        let frame = synthetic_frame(320, 2.0);
        let config = trainer
            .registry()
            .load_metadata("zeta")
            .unwrap()
            .unwrap()
            .config;
        let mut policy = PpoPolicy::new(
            10 * 35 + crate::env::N_PORTFOLIO_FEATURES,
            7,
            PolicyArch::Mlp,
            candle_core::Device::Cpu,
        )
        .unwrap();
        policy.load(&trainer.registry().model_path("zeta")).unwrap();
        let mut frozen = ObsNormalizer::load(&trainer.registry().normalizer_path("zeta")).unwrap();
        frozen.eval_mode();

        let mut env_a = TradingEnv::new(
            frame.clone(),
            &config,
            10,
            EnvOptions {
                seed: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
        let mut env_b = TradingEnv::new(
            frame,
            &config,
            10,
            EnvOptions {
                seed: Some(6),
                ..Default::default()
            },
        )
        .unwrap();

        let a = evaluate(&policy, std::slice::from_mut(&mut env_a), &frozen, 3);
        let b = evaluate(&policy, std::slice::from_mut(&mut env_b), &frozen, 3);
        // Same artifact + same seeds => identical metrics.
        assert_eq!(a.mean_return_pct, b.mean_return_pct);
        assert_eq!(a.mean_reward, b.mean_reward);
    }
}
