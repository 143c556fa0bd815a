// =============================================================================
// Training callbacks — progress tracking and curriculum phases
// =============================================================================

use serde::Serialize;

use crate::env::{RewardWeights, VecEnv};
use crate::policy::RolloutStats;
use crate::registry::sanitize;

/// One progress emission, shipped to the caller's callback at rollout
/// boundaries. Numeric values are finite or absent.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub agent_name: String,
    /// Session progress in [0, 1].
    pub progress: f64,
    /// Timesteps of this session (global counter minus the start capture).
    pub timesteps: usize,
    pub total_timesteps: usize,
    pub episodes: usize,
    pub mean_reward: Option<f64>,
    pub best_reward: Option<f64>,
}

/// Tracks per-session progress across rollouts. `start_timesteps` is
/// captured once from the (possibly resumed) global counter so
/// continue-training reports session-relative progress.
pub struct ProgressTracker {
    agent_name: String,
    total_timesteps: usize,
    start_timesteps: usize,
    episode_rewards: Vec<f64>,
    pub best_reward: Option<f64>,
}

impl ProgressTracker {
    pub fn new(agent_name: &str, total_timesteps: usize, start_timesteps: usize) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            total_timesteps: total_timesteps.max(1),
            start_timesteps,
            episode_rewards: Vec::new(),
            best_reward: None,
        }
    }

    pub fn episodes(&self) -> usize {
        self.episode_rewards.len()
    }

    /// Mean raw reward over the last 100 completed episodes.
    pub fn mean_reward(&self) -> Option<f64> {
        if self.episode_rewards.is_empty() {
            return None;
        }
        let tail = &self.episode_rewards[self.episode_rewards.len().saturating_sub(100)..];
        sanitize(tail.iter().sum::<f64>() / tail.len() as f64)
    }

    /// Session progress given the current global step counter.
    pub fn progress(&self, num_timesteps: usize) -> f64 {
        let session = num_timesteps.saturating_sub(self.start_timesteps);
        (session as f64 / self.total_timesteps as f64).min(1.0)
    }

    pub fn session_timesteps(&self, num_timesteps: usize) -> usize {
        num_timesteps.saturating_sub(self.start_timesteps)
    }

    /// Fold one rollout's episode results in and build a progress update.
    pub fn on_rollout(&mut self, stats: &RolloutStats, num_timesteps: usize) -> ProgressUpdate {
        for &(reward, _) in &stats.episodes {
            if reward.is_finite() {
                self.episode_rewards.push(reward);
                if reward > self.best_reward.unwrap_or(f64::NEG_INFINITY) {
                    self.best_reward = Some(reward);
                }
            }
        }
        ProgressUpdate {
            agent_name: self.agent_name.clone(),
            progress: self.progress(num_timesteps),
            timesteps: self.session_timesteps(num_timesteps),
            total_timesteps: self.total_timesteps,
            episodes: self.episode_rewards.len(),
            mean_reward: self.mean_reward(),
            best_reward: self.best_reward.and_then(sanitize),
        }
    }
}

// =============================================================================
// Curriculum
// =============================================================================

/// Per-phase multipliers applied to the base reward weights. Penalty scales
/// are strictly non-decreasing across phases.
#[derive(Debug, Clone, Copy)]
pub struct PhaseMultipliers {
    pub drawdown_penalty_scale: f64,
    pub step_fee_penalty_scale: f64,
    pub opportunity_cost_scale: f64,
    pub churning_penalty: f64,
    pub holding_in_range_bonus: f64,
    pub holding_too_long_penalty: f64,
}

/// Three-phase curriculum: start forgiving, end at full difficulty. Applied
/// at rollout boundaries by rescaling every environment's reward weights.
pub struct CurriculumCallback {
    pub current_phase: usize,
    pub phase_boundaries: [f64; 3],
    pub phase_multipliers: [PhaseMultipliers; 3],
    pub phase_names: [&'static str; 3],
    base: RewardWeights,
}

impl CurriculumCallback {
    pub fn new(base: RewardWeights) -> Self {
        Self {
            current_phase: 0,
            phase_boundaries: [0.0, 0.33, 0.66],
            phase_multipliers: [
                PhaseMultipliers {
                    drawdown_penalty_scale: 0.5,
                    step_fee_penalty_scale: 0.3,
                    opportunity_cost_scale: 0.2,
                    churning_penalty: 0.5,
                    holding_in_range_bonus: 1.5,
                    holding_too_long_penalty: 0.5,
                },
                PhaseMultipliers {
                    drawdown_penalty_scale: 1.0,
                    step_fee_penalty_scale: 0.7,
                    opportunity_cost_scale: 0.6,
                    churning_penalty: 1.0,
                    holding_in_range_bonus: 1.0,
                    holding_too_long_penalty: 1.0,
                },
                PhaseMultipliers {
                    drawdown_penalty_scale: 1.5,
                    step_fee_penalty_scale: 1.0,
                    opportunity_cost_scale: 1.0,
                    churning_penalty: 1.5,
                    holding_in_range_bonus: 0.8,
                    holding_too_long_penalty: 1.2,
                },
            ],
            phase_names: [
                "Phase 1: Easy",
                "Phase 2: Intermediate",
                "Phase 3: Full difficulty",
            ],
            base,
        }
    }

    fn phase_for(&self, progress: f64) -> usize {
        let mut phase = 0;
        for (i, &boundary) in self.phase_boundaries.iter().enumerate() {
            if progress >= boundary {
                phase = i;
            }
        }
        phase
    }

    fn weights_for_phase(&self, phase: usize) -> RewardWeights {
        let m = self.phase_multipliers[phase];
        let mut w = self.base.clone();
        w.drawdown_penalty_scale *= m.drawdown_penalty_scale;
        w.step_fee_penalty_scale *= m.step_fee_penalty_scale;
        w.opportunity_cost_scale *= m.opportunity_cost_scale;
        w.churning_penalty *= m.churning_penalty;
        w.holding_in_range_bonus *= m.holding_in_range_bonus;
        w.holding_too_long_penalty *= m.holding_too_long_penalty;
        w
    }

    /// Advance the curriculum if the session progress crossed a boundary.
    /// Returns the name of the newly entered phase when it changed.
    pub fn maybe_advance(&mut self, progress: f64, envs: &mut VecEnv) -> Option<&'static str> {
        let target = self.phase_for(progress);
        if target == self.current_phase && progress > 0.0 {
            return None;
        }
        let changed = target != self.current_phase || progress == 0.0;
        self.current_phase = target;
        if changed {
            let weights = self.weights_for_phase(target);
            for env in envs.envs_mut() {
                env.set_reward_weights(weights.clone());
            }
            return Some(self.phase_names[target]);
        }
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_reports_session_relative_progress() {
        // Resumed from 50k cumulative steps; session target 10k.
        let tracker = ProgressTracker::new("a", 10_000, 50_000);
        assert!((tracker.progress(55_000) - 0.5).abs() < 1e-12);
        assert_eq!(tracker.session_timesteps(55_000), 5_000);
        // Progress is capped at 1.0.
        assert!((tracker.progress(70_000) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn tracker_folds_episodes_and_best_reward() {
        let mut tracker = ProgressTracker::new("a", 1000, 0);
        let stats = RolloutStats {
            timesteps: 100,
            episodes: vec![(1.0, 10), (3.0, 12), (2.0, 9)],
        };
        let update = tracker.on_rollout(&stats, 100);
        assert_eq!(update.episodes, 3);
        assert_eq!(update.best_reward, Some(3.0));
        assert!((update.mean_reward.unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn tracker_drops_non_finite_rewards() {
        let mut tracker = ProgressTracker::new("a", 1000, 0);
        let stats = RolloutStats {
            timesteps: 100,
            episodes: vec![(f64::NAN, 10), (f64::INFINITY, 5), (1.0, 3)],
        };
        let update = tracker.on_rollout(&stats, 100);
        assert_eq!(update.episodes, 1);
        assert_eq!(update.best_reward, Some(1.0));
    }

    #[test]
    fn curriculum_has_three_phases() {
        let cb = CurriculumCallback::new(RewardWeights::default());
        assert_eq!(cb.current_phase, 0);
        assert_eq!(cb.phase_boundaries.len(), 3);
        assert_eq!(cb.phase_multipliers.len(), 3);
        assert!(cb.phase_names[0].contains("Easy"));
        assert!(cb.phase_names[2].contains("Full"));
    }

    #[test]
    fn penalty_multipliers_non_decreasing() {
        let cb = CurriculumCallback::new(RewardWeights::default());
        for i in 1..3 {
            let prev = cb.phase_multipliers[i - 1];
            let next = cb.phase_multipliers[i];
            assert!(next.drawdown_penalty_scale >= prev.drawdown_penalty_scale);
            assert!(next.step_fee_penalty_scale >= prev.step_fee_penalty_scale);
            assert!(next.opportunity_cost_scale >= prev.opportunity_cost_scale);
            assert!(next.churning_penalty >= prev.churning_penalty);
        }
    }

    #[test]
    fn phase_selection_by_progress() {
        let cb = CurriculumCallback::new(RewardWeights::default());
        assert_eq!(cb.phase_for(0.0), 0);
        assert_eq!(cb.phase_for(0.2), 0);
        assert_eq!(cb.phase_for(0.4), 1);
        assert_eq!(cb.phase_for(0.9), 2);
    }

    #[test]
    fn phase_weights_scale_base_table() {
        let base = RewardWeights::default();
        let cb = CurriculumCallback::new(base.clone());
        let easy = cb.weights_for_phase(0);
        let full = cb.weights_for_phase(2);
        assert!(easy.drawdown_penalty_scale < base.drawdown_penalty_scale);
        assert!(full.drawdown_penalty_scale > base.drawdown_penalty_scale);
        // Untouched weights stay as configured.
        assert!((easy.sharpe_scale - base.sharpe_scale).abs() < f64::EPSILON);
    }
}
