// =============================================================================
// Inference — trading signals, feature importance and sequential backtests
// =============================================================================
//
// Inference creates the environment in inference mode (observation anchored
// at the last bar), loads the persisted normalisation statistics frozen, and
// reads the policy's deterministic action plus its full probability vector.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::env::{Action, EnvInfo, EnvOptions, TradingEnv, TradeRecord, N_PORTFOLIO_FEATURES};
use crate::indicators::frame::ENV_FEATURE_COLUMNS;
use crate::indicators::FeatureFrame;
use crate::policy::{ObsNormalizer, PolicyArch, PpoPolicy};
use crate::trainer::{AgentTrainer, CachedPolicy, TrainError};
use crate::types::SignalStrength;

const PORTFOLIO_FEATURE_NAMES: [&str; N_PORTFOLIO_FEATURES] = [
    "cash_ratio",
    "long_position_ratio",
    "short_position_ratio",
    "unrealized_pnl_ratio",
    "holding_time_ratio",
    "current_drawdown",
    "is_short",
];

/// Signal produced by a trained agent for the current market state.
#[derive(Debug, Clone, Serialize)]
pub struct TradingSignal {
    /// One of "buy", "sell", "hold".
    pub signal: &'static str,
    /// Snake-case name of the chosen action.
    pub action: &'static str,
    pub strength: SignalStrength,
    /// Probability the policy assigned to the chosen action.
    pub confidence: f64,
    pub action_probabilities: HashMap<String, f64>,
    pub agent_name: String,
}

/// Full sequential backtest output.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub agent_name: String,
    pub total_steps: usize,
    pub total_reward: f64,
    pub final_info: EnvInfo,
    /// Tail of the equity curve (last 100 points).
    pub equity_curve: Vec<EquityPoint>,
    pub equity_curve_full_length: usize,
    /// Tail of the trade history (last 50 trades).
    pub trade_history: Vec<TradeRecord>,
    pub total_actions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub step: usize,
    pub portfolio_value: f64,
    pub cash: f64,
    pub return_pct: f64,
}

impl AgentTrainer {
    /// Load (or fetch from cache) the policy for an agent, rebuilt from the
    /// architecture recorded in its persisted config.
    pub(crate) fn load_policy(&self, agent_name: &str) -> Result<Arc<CachedPolicy>, TrainError> {
        if let Some(cached) = self.policies.read().get(agent_name) {
            return Ok(cached.clone());
        }

        let metadata = self
            .registry()
            .load_metadata(agent_name)?
            .ok_or_else(|| TrainError::AgentNotFound(agent_name.to_string()))?;
        if !self.registry().has_model(agent_name) {
            return Err(TrainError::AgentNotFound(agent_name.to_string()));
        }

        let config = metadata.config;
        let window_size = config
            .lookback_window
            .unwrap_or(self.settings().default_lookback_window);
        let n_features = ENV_FEATURE_COLUMNS.len();
        let obs_dim = window_size * n_features + N_PORTFOLIO_FEATURES;
        let n_actions = if config.enable_short_selling { 13 } else { 7 };

        let arch = PolicyArch::from_config(&config, window_size, n_features);
        let mut policy = PpoPolicy::new(obs_dim, n_actions, arch, self.settings().device())
            .context("failed to rebuild policy for inference")?;
        policy.load(&self.registry().model_path(agent_name))?;

        let cached = Arc::new(CachedPolicy {
            policy,
            config,
            window_size,
        });
        self.policies
            .write()
            .insert(agent_name.to_string(), cached.clone());
        Ok(cached)
    }

    /// Frozen normaliser for inference; identity pass-through when no
    /// statistics were persisted.
    fn frozen_normalizer(&self, agent_name: &str, obs_dim: usize) -> ObsNormalizer {
        let path = self.registry().normalizer_path(agent_name);
        let mut normalizer = if path.exists() {
            ObsNormalizer::load(&path).unwrap_or_else(|_| ObsNormalizer::new(obs_dim, 1, 0.99))
        } else {
            ObsNormalizer::new(obs_dim, 1, 0.99)
        };
        normalizer.eval_mode();
        normalizer
    }

    /// Deterministic trading signal from a trained agent over the given
    /// frame (≥ 100 bars).
    pub fn get_trading_signal(
        &self,
        agent_name: &str,
        frame: &FeatureFrame,
    ) -> Result<TradingSignal, TrainError> {
        let cached = self.load_policy(agent_name)?;

        let mut env = TradingEnv::new(
            frame.clone(),
            &cached.config,
            cached.window_size,
            EnvOptions {
                inference_mode: true,
                window_size: Some(cached.window_size),
                seed: Some(0),
                ..Default::default()
            },
        )?;

        let obs = env.reset(false);
        let normalizer = self.frozen_normalizer(agent_name, obs.len());
        let normalized = normalizer.apply_obs(&obs);

        let probs = cached.policy.action_probs(&normalized)?;
        let chosen = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let (signal, strength) = map_action_to_signal(chosen);
        let action = Action::from_index(chosen, true).unwrap_or(Action::Hold);

        let action_probabilities = probs
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let name = Action::from_index(i, true)
                    .map(|a| a.name())
                    .unwrap_or("unknown");
                (name.to_string(), p as f64)
            })
            .collect();

        Ok(TradingSignal {
            signal,
            action: action.name(),
            strength,
            confidence: probs[chosen] as f64,
            action_probabilities,
            agent_name: agent_name.to_string(),
        })
    }

    /// Perturbation-based feature importance: double each input feature (or
    /// pin near-zero values to 0.1), re-normalise, and measure the shift in
    /// the chosen action's probability. Returns the top 10 in percent.
    pub fn feature_importance(
        &self,
        agent_name: &str,
        frame: &FeatureFrame,
    ) -> Result<Vec<(String, f64)>, TrainError> {
        let cached = self.load_policy(agent_name)?;
        let window = cached.window_size;
        let n_features = ENV_FEATURE_COLUMNS.len();

        let mut env = TradingEnv::new(
            frame.clone(),
            &cached.config,
            window,
            EnvOptions {
                inference_mode: true,
                window_size: Some(window),
                seed: Some(0),
                ..Default::default()
            },
        )?;
        let raw = env.reset(false);
        let normalizer = self.frozen_normalizer(agent_name, raw.len());

        let base_probs = cached.policy.action_probs(&normalizer.apply_obs(&raw))?;
        let chosen = argmax(&base_probs);
        let base = base_probs[chosen];

        let mut impacts: Vec<(String, f64)> = Vec::new();
        let names = frame.env_feature_names();

        // Market features of the most recent bar in the window.
        for (j, name) in names.iter().enumerate() {
            let idx = (window - 1) * n_features + j;
            let mut perturbed = raw.clone();
            perturbed[idx] = if perturbed[idx].abs() > 0.001 {
                perturbed[idx] * 2.0
            } else {
                0.1
            };
            let probs = cached.policy.action_probs(&normalizer.apply_obs(&perturbed))?;
            let impact = ((probs[chosen] - base).abs() * 100.0 * 100.0).round() / 100.0;
            impacts.push((name.clone(), impact as f64));
        }

        // Portfolio features.
        for (i, name) in PORTFOLIO_FEATURE_NAMES.iter().enumerate() {
            let idx = window * n_features + i;
            let mut perturbed = raw.clone();
            perturbed[idx] = if perturbed[idx].abs() > 0.001 {
                perturbed[idx] * 2.0
            } else {
                0.5
            };
            let probs = cached.policy.action_probs(&normalizer.apply_obs(&perturbed))?;
            let impact = ((probs[chosen] - base).abs() * 100.0 * 100.0).round() / 100.0;
            impacts.push((name.to_string(), impact as f64));
        }

        impacts.sort_by(|a, b| b.1.total_cmp(&a.1));
        impacts.truncate(10);
        Ok(impacts)
    }

    /// Run a trained agent sequentially from the start of the frame (no
    /// random start), producing an equity curve and trade log.
    pub fn backtest_agent(
        &self,
        agent_name: &str,
        frame: &FeatureFrame,
    ) -> Result<BacktestReport, TrainError> {
        let cached = self.load_policy(agent_name)?;

        let mut env = TradingEnv::new(
            frame.clone(),
            &cached.config,
            cached.window_size,
            EnvOptions {
                window_size: Some(cached.window_size),
                seed: Some(0),
                ..Default::default()
            },
        )?;
        let normalizer = self.frozen_normalizer(agent_name, env.observation_dim());
        let mut rng = StdRng::seed_from_u64(0);

        let mut obs = env.reset(false);
        let mut total_reward = 0.0;
        let mut equity_curve = Vec::new();
        let mut total_actions = 0usize;
        let mut step = 0usize;

        let final_info = loop {
            let normalized = normalizer.apply_obs(&obs);
            let action_idx = cached.policy.predict(&normalized, true, &mut rng)?;
            let action =
                Action::from_index(action_idx, env.shorts_enabled()).unwrap_or(Action::Hold);
            if action != Action::Hold {
                total_actions += 1;
            }
            let result = env.step(action);
            total_reward += result.reward;
            step += 1;
            equity_curve.push(EquityPoint {
                step,
                portfolio_value: result.info.portfolio_value,
                cash: result.info.cash,
                return_pct: result.info.return_pct,
            });
            obs = result.observation;
            if result.terminated {
                break result.info;
            }
        };

        let full_length = equity_curve.len();
        let curve_tail = if full_length > 100 {
            equity_curve.split_off(full_length - 100)
        } else {
            equity_curve
        };
        let trades = env.trade_history();
        let trade_tail = if trades.len() > 50 {
            trades[trades.len() - 50..].to_vec()
        } else {
            trades.to_vec()
        };

        Ok(BacktestReport {
            agent_name: agent_name.to_string(),
            total_steps: step,
            total_reward,
            final_info,
            equity_curve: curve_tail,
            equity_curve_full_length: full_length,
            trade_history: trade_tail,
            total_actions,
        })
    }
}

/// Map a policy action index to (signal direction, strength). Short entries
/// read as sell signals and covers as buy signals so a short-enabled agent
/// still yields a directional scalar.
fn map_action_to_signal(index: usize) -> (&'static str, SignalStrength) {
    match index {
        1 => ("buy", SignalStrength::Weak),
        2 => ("buy", SignalStrength::Moderate),
        3 => ("buy", SignalStrength::Strong),
        4 => ("sell", SignalStrength::Weak),
        5 => ("sell", SignalStrength::Moderate),
        6 => ("sell", SignalStrength::Strong),
        7 => ("sell", SignalStrength::Weak),
        8 => ("sell", SignalStrength::Moderate),
        9 => ("sell", SignalStrength::Strong),
        10 => ("buy", SignalStrength::Weak),
        11 => ("buy", SignalStrength::Moderate),
        12 => ("buy", SignalStrength::Strong),
        _ => ("hold", SignalStrength::Neutral),
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_config::AgentConfig;
    use crate::config::ServiceSettings;
    use crate::indicators::calculate_indicators;
    use crate::registry::AgentRegistry;
    use crate::types::Bar;
    use std::collections::HashMap as StdHashMap;

    fn synthetic_frame(n: usize) -> FeatureFrame {
        let bars: Vec<Bar> = (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.19).sin() * 2.5 + i as f64 * 0.01;
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

    fn trained_trainer() -> (tempfile::TempDir, Arc<AgentTrainer>) {
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

        let mut config = AgentConfig::named("sig");
        config.lookback_window = Some(10);
        let mut data = StdHashMap::new();
        data.insert("AAPL".to_string(), synthetic_frame(320));
        trainer
            .train_agent_sync("sig", config, data, 64, false, None)
            .unwrap();
        (tmp, trainer)
    }

    #[test]
    fn signal_probs_sum_to_one_and_confidence_matches_chosen() {
        let (_tmp, trainer) = trained_trainer();
        let frame = synthetic_frame(200);
        let signal = trainer.get_trading_signal("sig", &frame).unwrap();

        let sum: f64 = signal.action_probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        let max = signal
            .action_probabilities
            .values()
            .fold(0.0f64, |a, &b| a.max(b));
        assert!((signal.confidence - max).abs() < 1e-9);
        assert!(matches!(signal.signal, "buy" | "sell" | "hold"));
    }

    #[test]
    fn signal_rejects_short_frames() {
        let (_tmp, trainer) = trained_trainer();
        let frame = synthetic_frame(80);
        let err = trainer.get_trading_signal("sig", &frame).unwrap_err();
        assert!(matches!(err, TrainError::Env(_)));
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let (_tmp, trainer) = trained_trainer();
        let frame = synthetic_frame(200);
        let err = trainer.get_trading_signal("ghost", &frame).unwrap_err();
        assert!(matches!(err, TrainError::AgentNotFound(_)));
    }

    #[test]
    fn repeated_inference_is_deterministic() {
        let (_tmp, trainer) = trained_trainer();
        let frame = synthetic_frame(200);
        let a = trainer.get_trading_signal("sig", &frame).unwrap();
        let b = trainer.get_trading_signal("sig", &frame).unwrap();
        assert_eq!(a.action, b.action);
        assert!((a.confidence - b.confidence).abs() < 1e-9);
    }

    #[test]
    fn feature_importance_returns_top_ten() {
        let (_tmp, trainer) = trained_trainer();
        let frame = synthetic_frame(200);
        let importance = trainer.feature_importance("sig", &frame).unwrap();
        assert!(importance.len() <= 10);
        assert!(!importance.is_empty());
        // Sorted descending.
        for pair in importance.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn backtest_produces_equity_curve() {
        let (_tmp, trainer) = trained_trainer();
        let frame = synthetic_frame(250);
        let report = trainer.backtest_agent("sig", &frame).unwrap();
        assert!(report.total_steps > 0);
        assert_eq!(report.equity_curve_full_length, report.total_steps);
        assert!(report.equity_curve.len() <= 100);
        assert!(report.final_info.portfolio_value > 0.0);
    }

    #[test]
    fn action_signal_mapping_covers_short_block() {
        assert_eq!(map_action_to_signal(0), ("hold", SignalStrength::Neutral));
        assert_eq!(map_action_to_signal(3), ("buy", SignalStrength::Strong));
        assert_eq!(map_action_to_signal(6), ("sell", SignalStrength::Strong));
        assert_eq!(map_action_to_signal(7), ("sell", SignalStrength::Weak));
        assert_eq!(map_action_to_signal(12), ("buy", SignalStrength::Strong));
    }
}
