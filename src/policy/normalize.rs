// =============================================================================
// Observation & reward normalisation with resumable running statistics
// =============================================================================
//
// Running mean/variance are updated only while `training` is set; inference
// and out-of-sample evaluation load the persisted statistics frozen. The
// whole state serialises to JSON next to the policy weights so a
// continue-training session resumes exactly where the last one stopped.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-8;

/// Welford-style running mean and variance over batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningMeanStd {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
    pub count: f64,
}

impl RunningMeanStd {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            var: vec![1.0; dim],
            count: 1e-4,
        }
    }

    /// Fold one sample vector into the running statistics.
    pub fn update(&mut self, sample: &[f64]) {
        debug_assert_eq!(sample.len(), self.mean.len());
        let batch_count = 1.0;
        let total = self.count + batch_count;
        for i in 0..self.mean.len() {
            let delta = sample[i] - self.mean[i];
            let new_mean = self.mean[i] + delta * batch_count / total;
            let m_a = self.var[i] * self.count;
            let m_b = 0.0;
            let m2 = m_a + m_b + delta * delta * self.count * batch_count / total;
            self.mean[i] = new_mean;
            self.var[i] = m2 / total;
        }
        self.count = total;
    }
}

/// Observation + reward normaliser, the persistence unit saved as
/// `vec_normalize.json` with every policy artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsNormalizer {
    pub obs_rms: RunningMeanStd,
    pub ret_rms: RunningMeanStd,
    pub clip_obs: f64,
    pub gamma: f64,
    /// Discounted return accumulator per sub-environment.
    returns: Vec<f64>,
    /// Update statistics on the fly; disabled for inference and OOS eval.
    pub training: bool,
    pub norm_reward: bool,
}

impl ObsNormalizer {
    pub fn new(obs_dim: usize, n_envs: usize, gamma: f64) -> Self {
        Self {
            obs_rms: RunningMeanStd::new(obs_dim),
            ret_rms: RunningMeanStd::new(1),
            clip_obs: 10.0,
            gamma,
            returns: vec![0.0; n_envs],
            training: true,
            norm_reward: true,
        }
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_rms.mean.len()
    }

    /// Resize the per-env return accumulators (after load into a vec-env of
    /// a different width).
    pub fn resize_envs(&mut self, n_envs: usize) {
        self.returns = vec![0.0; n_envs];
    }

    /// Normalise one observation; updates statistics when training.
    pub fn normalize_obs(&mut self, obs: &[f32]) -> Vec<f32> {
        if self.training {
            let sample: Vec<f64> = obs.iter().map(|&v| v as f64).collect();
            self.obs_rms.update(&sample);
        }
        self.apply_obs(obs)
    }

    /// Normalise without updating statistics (eval path).
    pub fn apply_obs(&self, obs: &[f32]) -> Vec<f32> {
        obs.iter()
            .enumerate()
            .map(|(i, &v)| {
                let norm = (v as f64 - self.obs_rms.mean[i])
                    / (self.obs_rms.var[i] + EPSILON).sqrt();
                norm.clamp(-self.clip_obs, self.clip_obs) as f32
            })
            .collect()
    }

    /// Normalise one env's step reward by the running return variance.
    pub fn normalize_reward(&mut self, env_idx: usize, reward: f64, done: bool) -> f64 {
        if !self.norm_reward {
            return reward;
        }
        if self.training {
            self.returns[env_idx] = self.returns[env_idx] * self.gamma + reward;
            let ret = self.returns[env_idx];
            self.ret_rms.update(&[ret]);
            if done {
                self.returns[env_idx] = 0.0;
            }
        }
        let scaled = reward / (self.ret_rms.var[0] + EPSILON).sqrt();
        scaled.clamp(-10.0, 10.0)
    }

    /// Switch into frozen evaluation mode.
    pub fn eval_mode(&mut self) {
        self.training = false;
        self.norm_reward = false;
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("failed to serialise normaliser state")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write normaliser to {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read normaliser from {}", path.display()))?;
        serde_json::from_str(&content).context("failed to parse normaliser state")
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_stats_converge_to_sample_moments() {
        let mut rms = RunningMeanStd::new(1);
        for i in 0..1000 {
            rms.update(&[(i % 10) as f64]);
        }
        // Uniform over 0..9: mean 4.5, var 8.25.
        assert!((rms.mean[0] - 4.5).abs() < 0.1);
        assert!((rms.var[0] - 8.25).abs() < 0.3);
    }

    #[test]
    fn normalized_obs_clipped() {
        let mut norm = ObsNormalizer::new(2, 1, 0.99);
        for _ in 0..100 {
            norm.normalize_obs(&[1.0, 2.0]);
        }
        let out = norm.apply_obs(&[1e9, -1e9]);
        assert!(out[0] <= 10.0 + 1e-6);
        assert!(out[1] >= -10.0 - 1e-6);
    }

    #[test]
    fn frozen_mode_does_not_update_stats() {
        let mut norm = ObsNormalizer::new(1, 1, 0.99);
        for _ in 0..50 {
            norm.normalize_obs(&[5.0]);
        }
        norm.eval_mode();
        let mean_before = norm.obs_rms.mean[0];
        for _ in 0..50 {
            let _ = norm.apply_obs(&[1000.0]);
        }
        assert!((norm.obs_rms.mean[0] - mean_before).abs() < f64::EPSILON);
    }

    #[test]
    fn reward_normalisation_shrinks_large_rewards() {
        let mut norm = ObsNormalizer::new(1, 1, 0.99);
        let mut last = 0.0;
        for _ in 0..200 {
            last = norm.normalize_reward(0, 100.0, false);
        }
        assert!(last.abs() < 100.0);
        assert!(last.abs() <= 10.0);
    }

    #[test]
    fn save_load_round_trip_preserves_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vec_normalize.json");
        let mut norm = ObsNormalizer::new(3, 2, 0.95);
        for i in 0..100 {
            norm.normalize_obs(&[i as f32, (i * 2) as f32, 0.5]);
        }
        norm.save(&path).unwrap();

        let loaded = ObsNormalizer::load(&path).unwrap();
        assert_eq!(loaded.obs_dim(), 3);
        for i in 0..3 {
            assert!((loaded.obs_rms.mean[i] - norm.obs_rms.mean[i]).abs() < 1e-12);
            assert!((loaded.obs_rms.var[i] - norm.obs_rms.var[i]).abs() < 1e-12);
        }
        // Identical stats produce identical normalised outputs.
        let a = norm.apply_obs(&[7.0, 8.0, 9.0]);
        let b = loaded.apply_obs(&[7.0, 8.0, 9.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn eval_mode_passes_reward_through() {
        let mut norm = ObsNormalizer::new(1, 1, 0.99);
        norm.eval_mode();
        let r = norm.normalize_reward(0, 3.5, false);
        assert!((r - 3.5).abs() < f64::EPSILON);
    }
}
