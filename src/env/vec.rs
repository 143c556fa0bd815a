// =============================================================================
// Vectorised environment — round-robin stepping over multiple simulators
// =============================================================================
//
// One TradingEnv per training symbol, stepped in lockstep. A terminated
// sub-environment auto-resets; its episode reward is surfaced in the step
// result so the trainer can track episode statistics.
// =============================================================================

use crate::env::{Action, EnvInfo, TradingEnv};

/// Outcome of stepping one sub-environment.
pub struct VecStep {
    pub observation: Vec<f32>,
    pub reward: f64,
    pub done: bool,
    pub info: EnvInfo,
    /// Total raw reward of the episode that just finished, when `done`.
    pub episode_reward: Option<f64>,
    /// Length of the episode that just finished, when `done`.
    pub episode_length: Option<usize>,
}

/// Fixed set of simulators stepped together.
pub struct VecEnv {
    envs: Vec<TradingEnv>,
    episode_rewards: Vec<f64>,
    episode_lengths: Vec<usize>,
}

impl VecEnv {
    pub fn new(envs: Vec<TradingEnv>) -> Self {
        let n = envs.len();
        Self {
            envs,
            episode_rewards: vec![0.0; n],
            episode_lengths: vec![0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    pub fn observation_dim(&self) -> usize {
        self.envs[0].observation_dim()
    }

    pub fn action_count(&self) -> usize {
        self.envs[0].action_count()
    }

    pub fn envs_mut(&mut self) -> &mut [TradingEnv] {
        &mut self.envs
    }

    /// Reset every sub-environment and return the stacked observations.
    pub fn reset_all(&mut self) -> Vec<Vec<f32>> {
        self.episode_rewards.iter_mut().for_each(|r| *r = 0.0);
        self.episode_lengths.iter_mut().for_each(|l| *l = 0);
        self.envs.iter_mut().map(|e| e.reset(true)).collect()
    }

    /// Step every sub-environment with its own action index. Invalid action
    /// indices degrade to HOLD. Terminated environments auto-reset.
    pub fn step(&mut self, action_indices: &[usize]) -> Vec<VecStep> {
        debug_assert_eq!(action_indices.len(), self.envs.len());
        let shorts = self.envs[0].shorts_enabled();
        let envs = &mut self.envs;
        let episode_rewards = &mut self.episode_rewards;
        let episode_lengths = &mut self.episode_lengths;

        envs.iter_mut()
            .zip(action_indices)
            .enumerate()
            .map(|(i, (env, &idx))| {
                let action = Action::from_index(idx, shorts).unwrap_or(Action::Hold);
                let result = env.step(action);
                episode_rewards[i] += result.reward;
                episode_lengths[i] += 1;

                let (episode_reward, episode_length, observation) = if result.terminated {
                    let er = episode_rewards[i];
                    let el = episode_lengths[i];
                    episode_rewards[i] = 0.0;
                    episode_lengths[i] = 0;
                    (Some(er), Some(el), env.reset(true))
                } else {
                    (None, None, result.observation)
                };

                VecStep {
                    observation,
                    reward: result.reward,
                    done: result.terminated,
                    info: result.info,
                    episode_reward,
                    episode_length,
                }
            })
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_config::AgentConfig;
    use crate::env::EnvOptions;
    use crate::indicators::calculate_indicators;
    use crate::types::Bar;

    fn make_env(n: usize, seed: u64) -> TradingEnv {
        let bars: Vec<Bar> = (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.17).sin() * 3.0;
                Bar {
                    timestamp: i as i64,
                    open: base,
                    high: base * 1.01,
                    low: base * 0.99,
                    close: base,
                    volume: 1e6,
                }
            })
            .collect();
        TradingEnv::new(
            calculate_indicators(&bars).unwrap(),
            &AgentConfig::named("test"),
            60,
            EnvOptions {
                seed: Some(seed),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn step_returns_one_result_per_env() {
        let mut vec_env = VecEnv::new(vec![make_env(200, 1), make_env(220, 2)]);
        vec_env.reset_all();
        let results = vec_env.step(&[0, 0]);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn terminated_env_auto_resets_with_episode_stats() {
        let mut vec_env = VecEnv::new(vec![make_env(120, 1)]);
        vec_env.reset_all();
        let mut saw_episode_end = false;
        for _ in 0..200 {
            let results = vec_env.step(&[0]);
            if results[0].done {
                assert!(results[0].episode_reward.is_some());
                assert!(results[0].episode_length.unwrap() > 0);
                // Auto-reset: a fresh observation comes back.
                assert!(!results[0].observation.is_empty());
                saw_episode_end = true;
                break;
            }
        }
        assert!(saw_episode_end);
    }

    #[test]
    fn invalid_action_degrades_to_hold() {
        let mut vec_env = VecEnv::new(vec![make_env(200, 1)]);
        vec_env.reset_all();
        // Index 12 is out of range for a long-only env.
        let results = vec_env.step(&[12]);
        assert_eq!(results[0].info.shares_held, 0.0);
        assert_eq!(results[0].info.shares_shorted, 0.0);
    }
}
