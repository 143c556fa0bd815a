// =============================================================================
// PPO — Proximal Policy Optimization over the trading environment
// =============================================================================
//
// Fixed outer recipe: 10 optimisation epochs per rollout, clip range 0.2,
// GAE(λ = 0.95), AdamW. The policy is either a plain MLP ([256, 256] heads
// straight off the observation) or the Transformer extractor with [256, 128]
// heads.
//
// Weights live in a single VarMap and persist as safetensors; loading into a
// policy built from the same architecture restores them by name.
// =============================================================================

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{
    linear, ops, AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::agent_config::AgentConfig;
use crate::env::VecEnv;
use crate::policy::extractor::{TransformerExtractor, TransformerShape};
use crate::policy::normalize::ObsNormalizer;
use crate::env::N_PORTFOLIO_FEATURES;

/// Which feature extractor the policy uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyArch {
    /// Observation straight into [256, 256] actor/critic heads.
    Mlp,
    /// Transformer extractor followed by [256, 128] heads.
    Transformer(TransformerShape),
}

impl PolicyArch {
    /// Derive the architecture from the persisted agent config and the
    /// environment dimensions.
    pub fn from_config(config: &AgentConfig, window_size: usize, n_features: usize) -> Self {
        if config.use_transformer_policy {
            Self::Transformer(TransformerShape {
                seq_len: window_size,
                input_dim: n_features,
                d_model: config.transformer_d_model,
                n_heads: config.transformer_n_heads,
                n_layers: config.transformer_n_layers,
                d_ff: config.transformer_d_ff,
                dropout: config.transformer_dropout,
            })
        } else {
            Self::Mlp
        }
    }

    fn head_widths(&self) -> [usize; 2] {
        match self {
            Self::Mlp => [256, 256],
            Self::Transformer(_) => [256, 128],
        }
    }
}

/// Actor-critic policy with a selectable feature extractor.
pub struct PpoPolicy {
    varmap: VarMap,
    device: Device,
    extractor: Option<TransformerExtractor>,
    actor: Vec<Linear>,
    critic: Vec<Linear>,
    obs_dim: usize,
    n_actions: usize,
}

impl PpoPolicy {
    pub fn new(obs_dim: usize, n_actions: usize, arch: PolicyArch, device: Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let (extractor, features_dim) = match arch {
            PolicyArch::Mlp => (None, obs_dim),
            PolicyArch::Transformer(shape) => {
                let ext = TransformerExtractor::new(
                    shape,
                    N_PORTFOLIO_FEATURES,
                    vb.pp("extractor"),
                    &device,
                )
                .map_err(|e| anyhow!("failed to build transformer extractor: {e}"))?;
                let dim = ext.features_dim();
                (Some(ext), dim)
            }
        };

        let widths = arch.head_widths();
        let build_head = |prefix: &str, out_dim: usize| -> Result<Vec<Linear>> {
            let mut layers = Vec::new();
            let mut in_dim = features_dim;
            for (i, &w) in widths.iter().enumerate() {
                layers.push(
                    linear(in_dim, w, vb.pp(format!("{prefix}.h{i}")))
                        .map_err(|e| anyhow!("failed to build {prefix} layer {i}: {e}"))?,
                );
                in_dim = w;
            }
            layers.push(
                linear(in_dim, out_dim, vb.pp(format!("{prefix}.out")))
                    .map_err(|e| anyhow!("failed to build {prefix} output layer: {e}"))?,
            );
            Ok(layers)
        };

        let actor = build_head("actor", n_actions)?;
        let critic = build_head("critic", 1)?;

        Ok(Self {
            varmap,
            device,
            extractor,
            actor,
            critic,
            obs_dim,
            n_actions,
        })
    }

    pub fn n_actions(&self) -> usize {
        self.n_actions
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn all_vars(&self) -> Vec<candle_core::Var> {
        self.varmap.all_vars()
    }

    fn features(&self, obs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match &self.extractor {
            Some(ext) => ext.forward(obs, train),
            None => Ok(obs.clone()),
        }
    }

    fn run_head(layers: &[Linear], features: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = features.clone();
        for (i, layer) in layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i + 1 < layers.len() {
                x = x.relu()?;
            }
        }
        Ok(x)
    }

    /// Action logits and state values for a batch of observations.
    pub fn forward(&self, obs: &Tensor, train: bool) -> candle_core::Result<(Tensor, Tensor)> {
        let features = self.features(obs, train)?;
        let logits = Self::run_head(&self.actor, &features)?;
        let values = Self::run_head(&self.critic, &features)?.squeeze(D::Minus1)?;
        Ok((logits, values))
    }

    /// Softmax action probabilities for a single observation (eval mode).
    pub fn action_probs(&self, obs: &[f32]) -> Result<Vec<f32>> {
        let tensor = Tensor::from_vec(obs.to_vec(), (1, obs.len()), &self.device)
            .context("failed to build observation tensor")?;
        let (logits, _) = self
            .forward(&tensor, false)
            .map_err(|e| anyhow!("policy forward failed: {e}"))?;
        let probs = ops::softmax(&logits, D::Minus1)
            .map_err(|e| anyhow!("softmax failed: {e}"))?;
        let out: Vec<f32> = probs
            .squeeze(0)
            .and_then(|t| t.to_vec1())
            .map_err(|e| anyhow!("failed to read probabilities: {e}"))?;
        Ok(out)
    }

    /// Pick an action for one observation. Deterministic mode takes the
    /// argmax; stochastic mode samples from the distribution.
    pub fn predict(&self, obs: &[f32], deterministic: bool, rng: &mut StdRng) -> Result<usize> {
        let probs = self.action_probs(obs)?;
        if deterministic {
            Ok(argmax(&probs))
        } else {
            Ok(sample_categorical(&probs, rng))
        }
    }

    /// Persist the weights as safetensors.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap
            .save(path)
            .with_context(|| format!("failed to save policy weights to {}", path.display()))
    }

    /// Load weights saved by [`save`] into this (architecture-identical)
    /// policy.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("failed to load policy weights from {}", path.display()))
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

fn sample_categorical(probs: &[f32], rng: &mut StdRng) -> usize {
    let r: f32 = rng.gen();
    let mut acc = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if r <= acc {
            return i;
        }
    }
    probs.len() - 1
}

// =============================================================================
// PPO driver
// =============================================================================

/// Hyperparameters of one PPO run.
#[derive(Debug, Clone)]
pub struct PpoParams {
    pub learning_rate: f64,
    pub gamma: f64,
    pub ent_coef: f64,
    pub clip_range: f64,
    pub n_epochs: usize,
    pub n_steps: usize,
    pub batch_size: usize,
    pub gae_lambda: f64,
    pub vf_coef: f64,
}

impl PpoParams {
    pub fn from_config(config: &AgentConfig, n_steps: usize, batch_size: usize) -> Self {
        Self {
            learning_rate: config.learning_rate,
            gamma: config.gamma,
            ent_coef: config.ent_coef,
            clip_range: 0.2,
            n_epochs: 10,
            n_steps,
            batch_size,
            gae_lambda: 0.95,
            vf_coef: 0.5,
        }
    }
}

/// Statistics of one rollout + update cycle.
#[derive(Debug, Clone, Default)]
pub struct RolloutStats {
    /// Env-steps collected in this cycle.
    pub timesteps: usize,
    /// Completed episodes as (raw reward, length).
    pub episodes: Vec<(f64, usize)>,
}

/// PPO state: policy, optimiser and the global step counter. The counter is
/// never reset on continue-training.
pub struct Ppo {
    pub policy: PpoPolicy,
    optimizer: AdamW,
    pub params: PpoParams,
    pub num_timesteps: usize,
    rng: StdRng,
}

impl Ppo {
    pub fn new(policy: PpoPolicy, params: PpoParams, seed: u64) -> Result<Self> {
        let optimizer = AdamW::new(
            policy.all_vars(),
            ParamsAdamW {
                lr: params.learning_rate,
                ..Default::default()
            },
        )
        .map_err(|e| anyhow!("failed to build optimiser: {e}"))?;
        Ok(Self {
            policy,
            optimizer,
            params,
            num_timesteps: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Collect one rollout of `n_steps × n_envs` transitions and run the
    /// clipped-surrogate update. `last_obs` carries the normalised
    /// observations across calls.
    pub fn collect_and_update(
        &mut self,
        envs: &mut VecEnv,
        normalizer: &mut ObsNormalizer,
        last_obs: &mut Vec<Vec<f32>>,
    ) -> Result<RolloutStats> {
        let n_envs = envs.len();
        let n_steps = self.params.n_steps;
        let obs_dim = self.policy.obs_dim();
        let total = n_steps * n_envs;

        let mut obs_buf: Vec<f32> = Vec::with_capacity(total * obs_dim);
        let mut action_buf: Vec<u32> = Vec::with_capacity(total);
        let mut reward_buf: Vec<f32> = Vec::with_capacity(total);
        let mut done_buf: Vec<bool> = Vec::with_capacity(total);
        let mut value_buf: Vec<f32> = Vec::with_capacity(total);
        let mut logp_buf: Vec<f32> = Vec::with_capacity(total);
        let mut stats = RolloutStats::default();

        for _ in 0..n_steps {
            // Batch forward over the current observations.
            let flat: Vec<f32> = last_obs.iter().flatten().copied().collect();
            let obs_tensor = Tensor::from_vec(flat.clone(), (n_envs, obs_dim), self.policy.device())
                .context("failed to build rollout observation batch")?;
            let (logits, values) = self
                .policy
                .forward(&obs_tensor, false)
                .map_err(|e| anyhow!("rollout forward failed: {e}"))?;
            let probs: Vec<Vec<f32>> = ops::softmax(&logits, D::Minus1)
                .and_then(|t| t.to_vec2())
                .map_err(|e| anyhow!("rollout softmax failed: {e}"))?;
            let values: Vec<f32> = values
                .to_vec1()
                .map_err(|e| anyhow!("rollout value read failed: {e}"))?;

            let actions: Vec<usize> = probs
                .iter()
                .map(|p| sample_categorical(p, &mut self.rng))
                .collect();

            let results = envs.step(&actions);

            for (i, step) in results.iter().enumerate() {
                obs_buf.extend_from_slice(&last_obs[i]);
                action_buf.push(actions[i] as u32);
                let norm_reward = normalizer.normalize_reward(i, step.reward, step.done);
                reward_buf.push(norm_reward as f32);
                done_buf.push(step.done);
                value_buf.push(values[i]);
                logp_buf.push((probs[i][actions[i]].max(1e-10)).ln());

                if let (Some(er), Some(el)) = (step.episode_reward, step.episode_length) {
                    stats.episodes.push((er, el));
                }

                last_obs[i] = normalizer.normalize_obs(&step.observation);
            }
        }
        self.num_timesteps += total;
        stats.timesteps = total;

        // Bootstrap value of the final observations.
        let flat: Vec<f32> = last_obs.iter().flatten().copied().collect();
        let obs_tensor = Tensor::from_vec(flat, (n_envs, obs_dim), self.policy.device())
            .context("failed to build bootstrap batch")?;
        let (_, last_values) = self
            .policy
            .forward(&obs_tensor, false)
            .map_err(|e| anyhow!("bootstrap forward failed: {e}"))?;
        let last_values: Vec<f32> = last_values
            .to_vec1()
            .map_err(|e| anyhow!("bootstrap value read failed: {e}"))?;

        // GAE, iterating steps backwards per environment.
        let mut advantages = vec![0f32; total];
        for e in 0..n_envs {
            let mut next_adv = 0f32;
            let mut next_value = last_values[e];
            for t in (0..n_steps).rev() {
                let idx = t * n_envs + e;
                let non_terminal = if done_buf[idx] { 0.0 } else { 1.0 };
                let delta = reward_buf[idx]
                    + self.params.gamma as f32 * next_value * non_terminal
                    - value_buf[idx];
                next_adv = delta
                    + (self.params.gamma * self.params.gae_lambda) as f32
                        * non_terminal
                        * next_adv;
                advantages[idx] = next_adv;
                next_value = value_buf[idx];
            }
        }
        let returns: Vec<f32> = advantages
            .iter()
            .zip(&value_buf)
            .map(|(a, v)| a + v)
            .collect();

        // Normalise advantages.
        let mean = advantages.iter().sum::<f32>() / total as f32;
        let var = advantages.iter().map(|a| (a - mean).powi(2)).sum::<f32>() / total as f32;
        let std = var.sqrt().max(1e-8);
        for a in advantages.iter_mut() {
            *a = (*a - mean) / std;
        }

        // Clipped-surrogate updates over shuffled minibatches.
        let mut indices: Vec<usize> = (0..total).collect();
        for _ in 0..self.params.n_epochs {
            shuffle(&mut indices, &mut self.rng);
            for chunk in indices.chunks(self.params.batch_size.max(1)) {
                self.update_minibatch(
                    chunk, &obs_buf, obs_dim, &action_buf, &logp_buf, &advantages, &returns,
                )?;
            }
        }

        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn update_minibatch(
        &mut self,
        indices: &[usize],
        obs_buf: &[f32],
        obs_dim: usize,
        action_buf: &[u32],
        logp_buf: &[f32],
        advantages: &[f32],
        returns: &[f32],
    ) -> Result<()> {
        let b = indices.len();
        let device = self.policy.device().clone();

        let mut obs = Vec::with_capacity(b * obs_dim);
        let mut actions = Vec::with_capacity(b);
        let mut old_logp = Vec::with_capacity(b);
        let mut adv = Vec::with_capacity(b);
        let mut ret = Vec::with_capacity(b);
        for &i in indices {
            obs.extend_from_slice(&obs_buf[i * obs_dim..(i + 1) * obs_dim]);
            actions.push(action_buf[i]);
            old_logp.push(logp_buf[i]);
            adv.push(advantages[i]);
            ret.push(returns[i]);
        }

        let run = || -> candle_core::Result<Tensor> {
            let obs_t = Tensor::from_vec(obs.clone(), (b, obs_dim), &device)?;
            let actions_t = Tensor::from_vec(actions.clone(), (b, 1), &device)?;
            let old_logp_t = Tensor::from_vec(old_logp.clone(), b, &device)?;
            let adv_t = Tensor::from_vec(adv.clone(), b, &device)?;
            let ret_t = Tensor::from_vec(ret.clone(), b, &device)?;

            let (logits, values) = self.policy.forward(&obs_t, true)?;
            let log_probs = ops::log_softmax(&logits, D::Minus1)?;
            let logp = log_probs.gather(&actions_t, 1)?.squeeze(1)?;

            let ratio = (&logp - &old_logp_t)?.exp()?;
            let clip = self.params.clip_range;
            let surr1 = (&ratio * &adv_t)?;
            let surr2 = (ratio.clamp(1.0 - clip, 1.0 + clip)? * &adv_t)?;
            let policy_loss = surr1.minimum(&surr2)?.mean_all()?.neg()?;

            let value_loss = (values - ret_t)?.sqr()?.mean_all()?;

            let probs = ops::softmax(&logits, D::Minus1)?;
            let entropy = (probs * log_probs)?.sum(D::Minus1)?.mean_all()?.neg()?;

            let loss = (policy_loss + (value_loss * self.params.vf_coef)?)?;
            let loss = (loss + (entropy * (-self.params.ent_coef))?)?;
            Ok(loss)
        };

        let loss = run().map_err(|e| anyhow!("ppo update failed: {e}"))?;
        self.optimizer
            .backward_step(&loss)
            .map_err(|e| anyhow!("optimiser step failed: {e}"))?;
        Ok(())
    }
}

fn shuffle(indices: &mut [usize], rng: &mut StdRng) {
    for i in (1..indices.len()).rev() {
        let j = rng.gen_range(0..=i);
        indices.swap(i, j);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvOptions, TradingEnv};
    use crate::indicators::calculate_indicators;
    use crate::types::Bar;

    fn tiny_env(seed: u64) -> TradingEnv {
        let bars: Vec<Bar> = (0..140)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.4).sin() * 2.0;
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
        let config = AgentConfig::named("test");
        TradingEnv::new(
            calculate_indicators(&bars).unwrap(),
            &config,
            60,
            EnvOptions {
                window_size: Some(10),
                seed: Some(seed),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn mlp_policy_probs_sum_to_one() {
        let policy = PpoPolicy::new(32, 7, PolicyArch::Mlp, Device::Cpu).unwrap();
        let obs = vec![0.1f32; 32];
        let probs = policy.action_probs(&obs).unwrap();
        assert_eq!(probs.len(), 7);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn deterministic_predict_is_argmax() {
        let policy = PpoPolicy::new(16, 7, PolicyArch::Mlp, Device::Cpu).unwrap();
        let obs = vec![0.3f32; 16];
        let probs = policy.action_probs(&obs).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let action = policy.predict(&obs, true, &mut rng).unwrap();
        assert_eq!(action, argmax(&probs));
    }

    #[test]
    fn save_load_round_trip_preserves_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        let policy = PpoPolicy::new(16, 7, PolicyArch::Mlp, Device::Cpu).unwrap();
        let obs = vec![0.5f32; 16];
        let before = policy.action_probs(&obs).unwrap();
        policy.save(&path).unwrap();

        let mut reloaded = PpoPolicy::new(16, 7, PolicyArch::Mlp, Device::Cpu).unwrap();
        reloaded.load(&path).unwrap();
        let after = reloaded.action_probs(&obs).unwrap();

        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn collect_and_update_advances_timesteps() {
        let mut vec_env = VecEnv::new(vec![tiny_env(1), tiny_env(2)]);
        let obs_dim = vec_env.observation_dim();
        let n_actions = vec_env.action_count();

        let policy = PpoPolicy::new(obs_dim, n_actions, PolicyArch::Mlp, Device::Cpu).unwrap();
        let params = PpoParams {
            learning_rate: 3e-4,
            gamma: 0.99,
            ent_coef: 0.01,
            clip_range: 0.2,
            n_epochs: 1,
            n_steps: 8,
            batch_size: 8,
            gae_lambda: 0.95,
            vf_coef: 0.5,
        };
        let mut ppo = Ppo::new(policy, params, 42).unwrap();

        let mut normalizer = ObsNormalizer::new(obs_dim, vec_env.len(), 0.99);
        let raw = vec_env.reset_all();
        let mut last_obs: Vec<Vec<f32>> =
            raw.iter().map(|o| normalizer.normalize_obs(o)).collect();

        let stats = ppo
            .collect_and_update(&mut vec_env, &mut normalizer, &mut last_obs)
            .unwrap();
        assert_eq!(stats.timesteps, 16);
        assert_eq!(ppo.num_timesteps, 16);

        // Policy still produces a valid distribution after an update.
        let probs = ppo.policy.action_probs(&last_obs[0]).unwrap();
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn sample_categorical_respects_degenerate_distribution() {
        let mut rng = StdRng::seed_from_u64(9);
        let probs = vec![0.0, 0.0, 1.0, 0.0];
        for _ in 0..20 {
            assert_eq!(sample_categorical(&probs, &mut rng), 2);
        }
    }

    #[test]
    fn arch_from_config_selects_transformer() {
        let mut config = AgentConfig::named("t");
        config.use_transformer_policy = true;
        config.transformer_d_model = 64;
        let arch = PolicyArch::from_config(&config, 60, 35);
        match arch {
            PolicyArch::Transformer(shape) => {
                assert_eq!(shape.d_model, 64);
                assert_eq!(shape.seq_len, 60);
                assert_eq!(shape.input_dim, 35);
            }
            _ => panic!("expected transformer arch"),
        }
    }
}
