// =============================================================================
// Reward configuration for the trading environment
// =============================================================================
//
// All shaping terms are driven by this weight table so the curriculum
// callback can harden penalties between training phases without touching
// the environment itself.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Weights of every reward term. Defaults form the fixed production table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardWeights {
    pub portfolio_return_scale: f64,
    pub holding_in_range_bonus: f64,
    pub holding_too_long_penalty: f64,
    pub drawdown_penalty_threshold: f64,
    pub drawdown_penalty_scale: f64,
    pub stop_loss_penalty: f64,
    pub take_profit_bonus: f64,
    pub trailing_stop_penalty: f64,
    pub episode_return_scale: f64,
    pub fee_ratio_penalty_threshold: f64,
    pub fee_ratio_penalty_scale: f64,
    pub churning_penalty: f64,
    pub risk_adjusted_scale: f64,
    pub win_rate_bonus_scale: f64,
    /// Prefer the Sharpe-style core over the plain portfolio-return core.
    pub use_sharpe_reward: bool,
    pub sharpe_scale: f64,
    pub sortino_scale: f64,
    pub consistency_bonus_scale: f64,
    pub step_fee_penalty_scale: f64,
    pub opportunity_cost_scale: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            portfolio_return_scale: 100.0,
            holding_in_range_bonus: 0.1,
            holding_too_long_penalty: 0.2,
            drawdown_penalty_threshold: 0.10,
            drawdown_penalty_scale: 2.0,
            stop_loss_penalty: 1.0,
            take_profit_bonus: 2.0,
            trailing_stop_penalty: 0.5,
            episode_return_scale: 50.0,
            fee_ratio_penalty_threshold: 0.5,
            fee_ratio_penalty_scale: 10.0,
            churning_penalty: 2.0,
            risk_adjusted_scale: 10.0,
            win_rate_bonus_scale: 20.0,
            use_sharpe_reward: true,
            sharpe_scale: 5.0,
            sortino_scale: 3.0,
            consistency_bonus_scale: 5.0,
            step_fee_penalty_scale: 2.0,
            opportunity_cost_scale: 0.5,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_values() {
        let w = RewardWeights::default();
        assert!((w.portfolio_return_scale - 100.0).abs() < f64::EPSILON);
        assert!((w.episode_return_scale - 50.0).abs() < f64::EPSILON);
        assert!((w.stop_loss_penalty - 1.0).abs() < f64::EPSILON);
        assert!((w.take_profit_bonus - 2.0).abs() < f64::EPSILON);
        assert!((w.consistency_bonus_scale - 5.0).abs() < f64::EPSILON);
        assert!(w.use_sharpe_reward);
    }

    #[test]
    fn serde_round_trip() {
        let w = RewardWeights::default();
        let json = serde_json::to_string(&w).unwrap();
        let back: RewardWeights = serde_json::from_str(&json).unwrap();
        assert!((back.sharpe_scale - w.sharpe_scale).abs() < f64::EPSILON);
    }
}
