// =============================================================================
// Trading Environment — gym-style market simulator for RL training
// =============================================================================
//
// Simulates stock trading with realistic constraints:
//   - Transaction costs (broker fees) with configurable slippage
//   - Long AND short positions with collateralised shorts
//   - Risk management (stop loss, take profit, trailing stop)
//   - Technical-indicator observations over a sliding window
//   - Extended metrics (Sharpe, Sortino, Calmar, Profit Factor)
//   - Configurable risk-adjusted reward function
//
// Observation: the last `window_size` rows of the feature matrix, per-column
// min-max normalised within the window, flattened, followed by 7 portfolio
// features.
// =============================================================================

pub mod action;
pub mod costs;
pub mod reward;
pub mod vec;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;

pub use action::{Action, N_ACTIONS_LONG_ONLY, N_ACTIONS_WITH_SHORTS};
pub use reward::RewardWeights;
pub use vec::{VecEnv, VecStep};

use crate::agent_config::{AgentConfig, SlippageModel};
use crate::indicators::frame::ENV_FEATURE_COLUMNS;
use crate::indicators::FeatureFrame;
use costs::BrokerFees;

/// Number of portfolio state features appended to the observation:
/// [cash_ratio, long_position_ratio, short_position_ratio,
///  unrealized_pnl_ratio, holding_time_ratio, current_drawdown, is_short]
pub const N_PORTFOLIO_FEATURES: usize = 7;

/// Orders below this notional are ignored.
const MIN_ORDER_VALUE: f64 = 100.0;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("frame must have at least 100 rows, got {0}")]
    InsufficientData(usize),
    #[error("frame missing required column: {0}")]
    MissingColumn(&'static str),
}

/// Construction-time options layered over the agent config.
#[derive(Debug, Clone, Default)]
pub struct EnvOptions {
    /// Start at the last bar instead of a random point; used for signals.
    pub inference_mode: bool,
    pub reward_weights: Option<RewardWeights>,
    pub enable_short_selling: Option<bool>,
    pub slippage_model: Option<SlippageModel>,
    pub slippage_bps: Option<f64>,
    pub window_size: Option<usize>,
    pub seed: Option<u64>,
}

/// One closed trade, kept for backtest reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub step: usize,
    pub action: &'static str,
    pub shares: f64,
    pub price: f64,
    pub profit: f64,
    pub holding_time: usize,
}

/// Per-step environment info, including the extended metric set.
#[derive(Debug, Clone, Serialize)]
pub struct EnvInfo {
    pub step: usize,
    pub cash: f64,
    pub shares_held: f64,
    pub shares_shorted: f64,
    pub portfolio_value: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub total_profit: f64,
    pub total_fees_paid: f64,
    pub fee_impact_pct: f64,
    pub max_drawdown: f64,
    pub return_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub benchmark_return_pct: f64,
    pub alpha_pct: f64,
}

/// Result of one environment step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Vec<f32>,
    pub reward: f64,
    pub terminated: bool,
    pub info: EnvInfo,
}

/// The trading simulator.
pub struct TradingEnv {
    frame: FeatureFrame,
    /// Dense copy of the env feature columns, rows × features.
    features: Array2<f64>,
    pub weights: RewardWeights,
    inference_mode: bool,
    enable_short_selling: bool,
    slippage_model: SlippageModel,
    slippage_bps: f64,
    window_size: usize,
    n_features: usize,

    initial_balance: f64,
    max_position_size: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    trailing_stop: bool,
    trailing_distance: f64,
    fees: BrokerFees,
    target_holding_period: usize,
    risk_multiplier: f64,

    rng: StdRng,

    // --- Episode state -------------------------------------------------------
    current_step: usize,
    start_step: usize,
    cash: f64,
    shares_held: f64,
    entry_price: f64,
    highest_price_since_entry: f64,
    holding_time: usize,
    shares_shorted: f64,
    short_entry_price: f64,
    lowest_price_since_short: f64,
    short_holding_time: usize,
    short_collateral: f64,

    total_trades: u32,
    winning_trades: u32,
    losing_trades: u32,
    total_profit: f64,
    total_fees_paid: f64,
    max_drawdown: f64,
    peak_value: f64,

    daily_returns: Vec<f64>,
    trade_profits: Vec<f64>,
    trade_history: Vec<TradeRecord>,
    benchmark_start_price: f64,
}

impl TradingEnv {
    pub fn new(
        frame: FeatureFrame,
        config: &AgentConfig,
        default_window: usize,
        options: EnvOptions,
    ) -> Result<Self, EnvError> {
        if frame.len() < 100 {
            return Err(EnvError::InsufficientData(frame.len()));
        }
        for col in ["open", "high", "low", "close", "volume"] {
            if frame.column(col).is_none() {
                return Err(EnvError::MissingColumn(col));
            }
        }

        let features = frame.select(ENV_FEATURE_COLUMNS);
        let n_features = features.ncols();
        let window_size = options
            .window_size
            .or(config.lookback_window)
            .unwrap_or(default_window);

        let seed = options.seed.unwrap_or_else(rand::random);

        let mut env = Self {
            features,
            weights: options.reward_weights.unwrap_or_default(),
            inference_mode: options.inference_mode,
            enable_short_selling: options
                .enable_short_selling
                .unwrap_or(config.enable_short_selling),
            slippage_model: options.slippage_model.unwrap_or(config.slippage_model),
            slippage_bps: options.slippage_bps.unwrap_or(config.slippage_bps),
            window_size,
            n_features,

            initial_balance: config.initial_balance,
            max_position_size: config.max_position_size,
            stop_loss_pct: config.stop_loss_percent,
            take_profit_pct: config.take_profit_percent,
            trailing_stop: config.trailing_stop,
            trailing_distance: config.trailing_stop_distance,
            fees: BrokerFees::for_profile(config.broker_profile),
            target_holding_period: config.holding_period.target_steps(),
            risk_multiplier: config.risk_profile.multiplier(),

            rng: StdRng::seed_from_u64(seed),

            current_step: 0,
            start_step: 0,
            cash: 0.0,
            shares_held: 0.0,
            entry_price: 0.0,
            highest_price_since_entry: 0.0,
            holding_time: 0,
            shares_shorted: 0.0,
            short_entry_price: 0.0,
            lowest_price_since_short: 0.0,
            short_holding_time: 0,
            short_collateral: 0.0,

            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_profit: 0.0,
            total_fees_paid: 0.0,
            max_drawdown: 0.0,
            peak_value: 0.0,

            daily_returns: Vec::new(),
            trade_profits: Vec::new(),
            trade_history: Vec::new(),
            benchmark_start_price: 0.0,
            frame,
        };
        env.reset(true);
        Ok(env)
    }

    // -------------------------------------------------------------------------
    // Space dimensions
    // -------------------------------------------------------------------------

    pub fn action_count(&self) -> usize {
        if self.enable_short_selling {
            N_ACTIONS_WITH_SHORTS
        } else {
            N_ACTIONS_LONG_ONLY
        }
    }

    pub fn observation_dim(&self) -> usize {
        self.window_size * self.n_features + N_PORTFOLIO_FEATURES
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn shorts_enabled(&self) -> bool {
        self.enable_short_selling
    }

    pub fn frame(&self) -> &FeatureFrame {
        &self.frame
    }

    pub fn trade_history(&self) -> &[TradeRecord] {
        &self.trade_history
    }

    /// Reseed the RNG; used by the evaluator for reproducible episodes.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn set_reward_weights(&mut self, weights: RewardWeights) {
        self.weights = weights;
    }

    // -------------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------------

    /// Reset the episode. In inference mode the episode starts at the last
    /// bar; otherwise at a random point in `[window, len − window − 100]`
    /// (or the window start when `random_start` is off or the frame is too
    /// short for the range).
    pub fn reset(&mut self, random_start: bool) -> Vec<f32> {
        let min_start = self.window_size;
        let max_start = self.frame.len() as i64 - self.window_size as i64 - 100;

        self.current_step = if self.inference_mode {
            self.frame.len() - 1
        } else if random_start && max_start > min_start as i64 {
            self.rng.gen_range(min_start..max_start as usize)
        } else {
            min_start
        };

        self.cash = self.initial_balance;
        self.shares_held = 0.0;
        self.entry_price = 0.0;
        self.highest_price_since_entry = 0.0;
        self.holding_time = 0;

        self.shares_shorted = 0.0;
        self.short_entry_price = 0.0;
        self.lowest_price_since_short = 0.0;
        self.short_holding_time = 0;
        self.short_collateral = 0.0;

        self.total_trades = 0;
        self.winning_trades = 0;
        self.losing_trades = 0;
        self.total_profit = 0.0;
        self.total_fees_paid = 0.0;
        self.max_drawdown = 0.0;
        self.peak_value = self.initial_balance;

        self.daily_returns.clear();
        self.trade_profits.clear();
        self.trade_history.clear();

        self.benchmark_start_price = self.frame.close(self.current_step);
        self.start_step = self.current_step;

        self.observation()
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    /// Current observation: window-normalised features + portfolio state.
    pub fn observation(&self) -> Vec<f32> {
        let start = self.current_step.saturating_sub(self.window_size);
        let end = self.current_step.max(self.window_size);
        let mut obs = Vec::with_capacity(self.observation_dim());

        // Per-column min-max normalisation within the window, row-major.
        let mut mins = vec![f64::MAX; self.n_features];
        let mut maxs = vec![f64::MIN; self.n_features];
        for i in start..end {
            for j in 0..self.n_features {
                let v = self.features[[i, j]];
                if v < mins[j] {
                    mins[j] = v;
                }
                if v > maxs[j] {
                    maxs[j] = v;
                }
            }
        }
        for i in start..end {
            for j in 0..self.n_features {
                let range = maxs[j] - mins[j];
                let v = if range > 1e-8 {
                    (self.features[[i, j]] - mins[j]) / range
                } else {
                    0.5
                };
                obs.push(v as f32);
            }
        }

        let price = self.frame.close(self.current_step.min(self.frame.len() - 1));
        let pv = self.portfolio_value(price);

        let cash_ratio = self.cash / self.initial_balance;
        let long_ratio = if pv > 0.0 {
            self.shares_held * price / pv
        } else {
            0.0
        };
        let short_ratio = if pv > 0.0 {
            self.shares_shorted * price / pv
        } else {
            0.0
        };

        let mut unrealized = 0.0;
        if self.shares_held > 0.0 && self.entry_price > 0.0 {
            unrealized += (price - self.entry_price) / self.entry_price;
        }
        if self.shares_shorted > 0.0 && self.short_entry_price > 0.0 {
            unrealized += (self.short_entry_price - price) / self.short_entry_price;
        }

        let ht = self.holding_time.max(self.short_holding_time);
        let holding_ratio = if self.shares_held > 0.0 || self.shares_shorted > 0.0 {
            (ht as f64 / self.target_holding_period as f64).min(2.0)
        } else {
            0.0
        };
        let drawdown = if self.peak_value > 0.0 {
            (self.peak_value - pv) / self.peak_value
        } else {
            0.0
        };
        let is_short = if self.shares_shorted > 0.0 { 1.0 } else { 0.0 };

        obs.extend_from_slice(&[
            cash_ratio as f32,
            long_ratio as f32,
            short_ratio as f32,
            unrealized as f32,
            holding_ratio as f32,
            drawdown as f32,
            is_short as f32,
        ]);

        obs
    }

    // -------------------------------------------------------------------------
    // Portfolio accounting
    // -------------------------------------------------------------------------

    /// cash + long value + short collateral + short PnL.
    pub fn portfolio_value(&self, price: f64) -> f64 {
        let long_val = self.shares_held * price;
        let short_pnl = if self.shares_shorted > 0.0 {
            (self.short_entry_price - price) * self.shares_shorted
        } else {
            0.0
        };
        self.cash + long_val + self.short_collateral + short_pnl
    }

    fn transaction_cost(&mut self, trade_value: f64) -> f64 {
        let cost = self.fees.transaction_cost(trade_value);
        self.total_fees_paid += cost;
        cost
    }

    fn execution_price(&mut self, base_price: f64, trade_value: f64, is_buy: bool) -> f64 {
        let volume = self.frame.volume(self.current_step);
        costs::execution_price(
            self.slippage_model,
            self.slippage_bps,
            base_price,
            trade_value,
            volume,
            is_buy,
            &mut self.rng,
        )
    }

    fn record_trade(
        &mut self,
        action: &'static str,
        shares: f64,
        price: f64,
        profit: f64,
        holding_time: usize,
    ) {
        self.trade_history.push(TradeRecord {
            step: self.current_step,
            action,
            shares,
            price,
            profit,
            holding_time,
        });
        self.trade_profits.push(profit);
        self.total_profit += profit;
        self.total_trades += 1;
        if profit > 0.0 {
            self.winning_trades += 1;
        } else if profit < 0.0 {
            self.losing_trades += 1;
        }
    }

    fn close_long(&mut self, shares_to_sell: f64, current_price: f64) {
        if shares_to_sell <= 0.0 || self.shares_held <= 0.0 {
            return;
        }
        let shares = shares_to_sell.min(self.shares_held);
        let trade_value = shares * current_price;
        let exec = self.execution_price(current_price, trade_value, false);
        let revenue = shares * exec;
        let cost = self.transaction_cost(revenue);
        let profit = revenue - cost - shares * self.entry_price;
        let holding = self.holding_time;
        self.record_trade("sell", shares, exec, profit, holding);
        self.cash += revenue - cost;
        self.shares_held -= shares;
        if self.shares_held <= 0.0 {
            self.shares_held = 0.0;
            self.holding_time = 0;
            self.entry_price = 0.0;
        }
    }

    fn close_short(&mut self, shares_to_cover: f64, current_price: f64) {
        if shares_to_cover <= 0.0 || self.shares_shorted <= 0.0 {
            return;
        }
        let shares = shares_to_cover.min(self.shares_shorted);
        let trade_value = shares * current_price;
        let exec = self.execution_price(current_price, trade_value, true);
        let cost = self.transaction_cost(shares * exec);
        let profit = (self.short_entry_price - exec) * shares - cost;
        let holding = self.short_holding_time;
        self.record_trade("cover", shares, exec, profit, holding);
        let collateral_returned = if self.shares_shorted > 0.0 {
            self.short_collateral * (shares / self.shares_shorted)
        } else {
            self.short_collateral
        };
        self.cash += collateral_returned + profit;
        self.short_collateral -= collateral_returned;
        self.shares_shorted -= shares;
        if self.shares_shorted <= 0.0 {
            self.shares_shorted = 0.0;
            self.short_holding_time = 0;
            self.short_entry_price = 0.0;
            self.short_collateral = 0.0;
        }
    }

    // -------------------------------------------------------------------------
    // Step
    // -------------------------------------------------------------------------

    pub fn step(&mut self, action: Action) -> StepResult {
        let current_price = self.frame.close(self.current_step);
        let prev_value = self.portfolio_value(current_price);
        let fees_before = self.total_fees_paid;
        let mut reward = 0.0;

        // ---- 1. Execute the action ----
        if action.is_buy() {
            let frac = (action.entry_fraction().unwrap() * self.risk_multiplier)
                .min(self.max_position_size);
            let amount = self.cash * frac;
            if amount > MIN_ORDER_VALUE {
                let exec = self.execution_price(current_price, amount, true);
                let shares = (amount / exec).floor();
                if shares > 0.0 {
                    let cost = shares * exec;
                    let fees = self.transaction_cost(cost);
                    if cost + fees <= self.cash {
                        self.cash -= cost + fees;
                        if self.shares_held == 0.0 {
                            self.entry_price = exec;
                            self.highest_price_since_entry = current_price;
                        } else {
                            let total = self.shares_held + shares;
                            self.entry_price =
                                (self.entry_price * self.shares_held + exec * shares) / total;
                        }
                        self.shares_held += shares;
                        self.holding_time = 0;
                    }
                }
            }
        } else if action.is_sell() {
            if self.shares_held > 0.0 {
                let frac = action.exit_fraction().unwrap();
                let shares = if frac >= 1.0 {
                    self.shares_held
                } else {
                    (self.shares_held * frac).floor()
                };
                self.close_long(shares, current_price);
            }
        } else if self.enable_short_selling && action.is_short() {
            let frac = (action.entry_fraction().unwrap() * self.risk_multiplier)
                .min(self.max_position_size);
            let amount = self.cash * frac;
            if amount > MIN_ORDER_VALUE {
                let exec = self.execution_price(current_price, amount, false);
                let shares = (amount / exec).floor();
                if shares > 0.0 {
                    let collateral = shares * exec;
                    let fees = self.transaction_cost(collateral);
                    if collateral + fees <= self.cash {
                        self.cash -= collateral + fees;
                        self.short_collateral += collateral;
                        if self.shares_shorted == 0.0 {
                            self.short_entry_price = exec;
                            self.lowest_price_since_short = current_price;
                        } else {
                            let total = self.shares_shorted + shares;
                            self.short_entry_price = (self.short_entry_price
                                * self.shares_shorted
                                + exec * shares)
                                / total;
                        }
                        self.shares_shorted += shares;
                        self.short_holding_time = 0;
                    }
                }
            }
        } else if self.enable_short_selling && action.is_cover() && self.shares_shorted > 0.0 {
            let frac = action.exit_fraction().unwrap();
            let shares = if frac >= 1.0 {
                self.shares_shorted
            } else {
                (self.shares_shorted * frac).floor()
            };
            self.close_short(shares, current_price);
        }

        // ---- 2. Holding counters and trailing extremes ----
        if self.shares_held > 0.0 {
            self.holding_time += 1;
            self.highest_price_since_entry = self.highest_price_since_entry.max(current_price);
        }
        if self.shares_shorted > 0.0 {
            self.short_holding_time += 1;
            self.lowest_price_since_short = self.lowest_price_since_short.min(current_price);
        }

        // ---- 3. SL/TP on long ----
        if self.shares_held > 0.0 && self.entry_price > 0.0 {
            let unrealized = (current_price - self.entry_price) / self.entry_price;
            if self.trailing_stop {
                let from_high = (current_price - self.highest_price_since_entry)
                    / self.highest_price_since_entry;
                if from_high < -self.trailing_distance {
                    self.close_long(self.shares_held, current_price);
                    reward -= self.weights.trailing_stop_penalty;
                }
            } else if unrealized <= -self.stop_loss_pct {
                self.close_long(self.shares_held, current_price);
                reward -= self.weights.stop_loss_penalty;
            } else if unrealized >= self.take_profit_pct {
                self.close_long(self.shares_held, current_price);
                reward += self.weights.take_profit_bonus;
            }
        }

        // ---- 4. SL/TP on short (symmetric) ----
        if self.shares_shorted > 0.0 && self.short_entry_price > 0.0 {
            let unrealized = (self.short_entry_price - current_price) / self.short_entry_price;
            if unrealized <= -self.stop_loss_pct {
                self.close_short(self.shares_shorted, current_price);
                reward -= self.weights.stop_loss_penalty;
            } else if unrealized >= self.take_profit_pct {
                self.close_short(self.shares_shorted, current_price);
                reward += self.weights.take_profit_bonus;
            }
        }

        // ---- 5. Advance and re-account ----
        self.current_step += 1;
        let next_idx = self.current_step.min(self.frame.len() - 1);
        let new_price = self.frame.close(next_idx);
        let value = self.portfolio_value(new_price);

        let step_return = if prev_value > 0.0 {
            (value - prev_value) / prev_value
        } else {
            0.0
        };
        self.daily_returns.push(step_return);

        if value > self.peak_value {
            self.peak_value = value;
        }
        let drawdown = if self.peak_value > 0.0 {
            (self.peak_value - value) / self.peak_value
        } else {
            0.0
        };
        self.max_drawdown = self.max_drawdown.max(drawdown);

        // ---- 6. Step reward shaping ----
        let step_fees = self.total_fees_paid - fees_before;
        let market_return = if current_price > 0.0 {
            (new_price - current_price) / current_price
        } else {
            0.0
        };
        reward += self.step_reward(step_return, drawdown, step_fees, market_return);

        // ---- 7. Terminal ----
        let terminated = self.current_step >= self.frame.len() - 1;
        if terminated {
            reward += self.episode_end_reward(new_price);
        }

        StepResult {
            observation: self.observation(),
            reward,
            terminated,
            info: self.info(),
        }
    }

    // -------------------------------------------------------------------------
    // Rewards
    // -------------------------------------------------------------------------

    fn step_reward(
        &self,
        step_return: f64,
        current_drawdown: f64,
        step_fees: f64,
        market_return: f64,
    ) -> f64 {
        let w = &self.weights;
        let mut reward = 0.0;

        // Sharpe-style core when enough history, else plain scaled return.
        if w.use_sharpe_reward && self.daily_returns.len() > 10 {
            let tail = &self.daily_returns[self.daily_returns.len().saturating_sub(20)..];
            let std = std_dev(tail);
            if std > 1e-8 {
                reward += (step_return / std) * w.sharpe_scale;
            } else {
                reward += step_return * w.portfolio_return_scale * self.risk_multiplier;
            }
        } else {
            reward += step_return * w.portfolio_return_scale * self.risk_multiplier;
        }

        // Holding-period shaping.
        let ht = self.holding_time.max(self.short_holding_time);
        if ht > 0 {
            let ratio = ht as f64 / self.target_holding_period as f64;
            if (0.5..=2.0).contains(&ratio) {
                reward += w.holding_in_range_bonus;
            } else if ratio > 3.0 {
                reward -= w.holding_too_long_penalty;
            }
        }

        // Drawdown penalty.
        if current_drawdown > w.drawdown_penalty_threshold {
            reward -= current_drawdown * w.drawdown_penalty_scale;
        }

        // Per-step fee awareness.
        if step_fees > 0.0 && self.initial_balance > 0.0 {
            reward -= step_fees / self.initial_balance * w.step_fee_penalty_scale;
        }

        // Opportunity cost: flat while the market moves up.
        if self.shares_held == 0.0 && self.shares_shorted == 0.0 && market_return > 0.0 {
            reward -= market_return * w.opportunity_cost_scale;
        }

        // Consistency bonus over the last 10 returns.
        if self.daily_returns.len() >= 10 {
            let tail = &self.daily_returns[self.daily_returns.len() - 10..];
            let positive = tail.iter().filter(|&&r| r > 0.0).count() as f64 / 10.0;
            if positive >= 0.6 {
                reward += (positive - 0.5) * w.consistency_bonus_scale;
                let mean = tail.iter().sum::<f64>() / 10.0;
                if std_dev(tail) < 0.005 && mean > 0.0 {
                    reward += 0.2 * w.consistency_bonus_scale;
                }
            }
        }

        reward
    }

    fn episode_end_reward(&mut self, final_price: f64) -> f64 {
        let w = self.weights.clone();
        let mut reward = 0.0;

        // Liquidate remaining positions at the close.
        if self.shares_held > 0.0 {
            self.close_long(self.shares_held, final_price);
        }
        if self.shares_shorted > 0.0 {
            self.close_short(self.shares_shorted, final_price);
        }

        let final_value = self.cash;
        let total_return = (final_value - self.initial_balance) / self.initial_balance;

        // 1. Total return.
        reward += total_return * w.episode_return_scale;

        // 2. Fee-impact / churning penalty.
        let gross_profit = self.total_profit + self.total_fees_paid;
        if gross_profit > 0.0 {
            let fee_ratio = self.total_fees_paid / gross_profit;
            if fee_ratio > w.fee_ratio_penalty_threshold {
                reward -= (fee_ratio - w.fee_ratio_penalty_threshold) * w.fee_ratio_penalty_scale;
            }
        } else if self.total_trades > 0
            && self.total_fees_paid / self.total_trades as f64 > self.initial_balance * 0.001
        {
            reward -= w.churning_penalty;
        }

        // 3. Risk-adjusted component.
        if self.daily_returns.len() > 10 {
            let std = std_dev(&self.daily_returns);
            if std > 1e-8 {
                let mean = self.daily_returns.iter().sum::<f64>() / self.daily_returns.len() as f64;
                let sharpe = mean / std * (252.0_f64).sqrt();
                reward += sharpe * w.risk_adjusted_scale;
                let down: Vec<f64> = self
                    .daily_returns
                    .iter()
                    .copied()
                    .filter(|&r| r < 0.0)
                    .collect();
                if !down.is_empty() {
                    let ds = std_dev(&down);
                    if ds > 1e-8 {
                        let sortino = mean / ds * (252.0_f64).sqrt();
                        reward += (sortino - sharpe).max(0.0) * w.sortino_scale;
                    }
                }
            } else if self.max_drawdown > 0.0 {
                reward += total_return / (self.max_drawdown + 0.01) * w.risk_adjusted_scale;
            }
        } else if self.max_drawdown > 0.0 {
            reward += total_return / (self.max_drawdown + 0.01) * w.risk_adjusted_scale;
        }

        // 4. Win-rate bonus.
        if self.total_trades > 0 {
            let win_rate = self.winning_trades as f64 / self.total_trades as f64;
            if win_rate > 0.5 {
                reward += (win_rate - 0.5) * w.win_rate_bonus_scale;
            }
        }

        // 5. Alpha vs buy-and-hold.
        if self.benchmark_start_price > 0.0 {
            let benchmark =
                (final_price - self.benchmark_start_price) / self.benchmark_start_price;
            let alpha = total_return - benchmark;
            reward += if alpha > 0.0 { alpha * 20.0 } else { alpha * 10.0 };
        }

        reward
    }

    // -------------------------------------------------------------------------
    // Metrics & info
    // -------------------------------------------------------------------------

    pub fn info(&self) -> EnvInfo {
        let idx = self.current_step.min(self.frame.len() - 1);
        let price = self.frame.close(idx);
        let pv = self.portfolio_value(price);

        let (sharpe, sortino) = self.sharpe_sortino();
        let total_return = (pv - self.initial_balance) / self.initial_balance;
        let steps = self.daily_returns.len().max(1);
        let annualized = total_return * (252.0 / steps as f64);
        let calmar = if self.max_drawdown > 1e-8 {
            annualized / self.max_drawdown
        } else {
            0.0
        };

        let wins: f64 = self.trade_profits.iter().filter(|&&p| p > 0.0).sum();
        let losses: f64 = self
            .trade_profits
            .iter()
            .filter(|&&p| p < 0.0)
            .map(|p| p.abs())
            .sum();
        let profit_factor = if losses > 0.0 {
            wins / losses
        } else if wins > 0.0 {
            999.0
        } else {
            0.0
        };

        let win_values: Vec<f64> = self
            .trade_profits
            .iter()
            .copied()
            .filter(|&p| p > 0.0)
            .collect();
        let loss_values: Vec<f64> = self
            .trade_profits
            .iter()
            .copied()
            .filter(|&p| p < 0.0)
            .collect();
        let avg_win = mean_or_zero(&win_values);
        let avg_loss = mean_or_zero(&loss_values);

        let benchmark_return_pct = if self.benchmark_start_price > 0.0 {
            (price - self.benchmark_start_price) / self.benchmark_start_price * 100.0
        } else {
            0.0
        };

        EnvInfo {
            step: self.current_step,
            cash: self.cash,
            shares_held: self.shares_held,
            shares_shorted: self.shares_shorted,
            portfolio_value: pv,
            total_trades: self.total_trades,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            win_rate: self.winning_trades as f64 / self.total_trades.max(1) as f64,
            total_profit: self.total_profit,
            total_fees_paid: self.total_fees_paid,
            fee_impact_pct: if self.initial_balance > 0.0 {
                self.total_fees_paid / self.initial_balance * 100.0
            } else {
                0.0
            },
            max_drawdown: self.max_drawdown,
            return_pct: total_return * 100.0,
            sharpe_ratio: sharpe,
            sortino_ratio: sortino,
            calmar_ratio: calmar,
            profit_factor,
            avg_win,
            avg_loss,
            benchmark_return_pct,
            alpha_pct: total_return * 100.0 - benchmark_return_pct,
        }
    }

    fn sharpe_sortino(&self) -> (f64, f64) {
        if self.daily_returns.len() <= 5 {
            return (0.0, 0.0);
        }
        let mean = self.daily_returns.iter().sum::<f64>() / self.daily_returns.len() as f64;
        let std = std_dev(&self.daily_returns);
        let sharpe = if std > 1e-8 {
            mean / std * (252.0_f64).sqrt()
        } else {
            0.0
        };
        let down: Vec<f64> = self
            .daily_returns
            .iter()
            .copied()
            .filter(|&r| r < 0.0)
            .collect();
        let sortino = if down.is_empty() {
            sharpe * 2.0
        } else {
            let ds = std_dev(&down);
            if ds > 1e-8 {
                mean / ds * (252.0_f64).sqrt()
            } else {
                sharpe * 1.5
            }
        };
        (sharpe, sortino)
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
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

    fn make_frame(n: usize) -> FeatureFrame {
        let bars: Vec<Bar> = (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.21).sin() * 4.0 + i as f64 * 0.02;
                Bar {
                    timestamp: 86_400_000 * i as i64,
                    open: base * 0.999,
                    high: base * 1.012,
                    low: base * 0.988,
                    close: base,
                    volume: 2_000_000.0,
                }
            })
            .collect();
        calculate_indicators(&bars).unwrap()
    }

    fn make_env(n: usize, short: bool) -> TradingEnv {
        let config = AgentConfig::named("test");
        TradingEnv::new(
            make_frame(n),
            &config,
            60,
            EnvOptions {
                enable_short_selling: Some(short),
                slippage_model: Some(SlippageModel::None),
                seed: Some(7),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_insufficient_data() {
        let config = AgentConfig::named("test");
        let err = TradingEnv::new(make_frame(50), &config, 60, EnvOptions::default());
        assert!(matches!(err, Err(EnvError::InsufficientData(50))));
    }

    #[test]
    fn observation_shape_includes_portfolio_features() {
        let env = make_env(250, false);
        let obs = env.observation();
        assert_eq!(obs.len(), env.window_size() * env.n_features() + N_PORTFOLIO_FEATURES);
    }

    #[test]
    fn observation_all_finite_and_window_normalised() {
        let env = make_env(250, false);
        let obs = env.observation();
        for &v in &obs {
            assert!(v.is_finite());
        }
        // Window features are min-max normalised into [0, 1].
        for &v in &obs[..obs.len() - N_PORTFOLIO_FEATURES] {
            assert!((-1e-6..=1.0 + 1e-6).contains(&(v as f64)));
        }
    }

    #[test]
    fn action_space_depends_on_short_flag() {
        assert_eq!(make_env(250, false).action_count(), 7);
        assert_eq!(make_env(250, true).action_count(), 13);
    }

    #[test]
    fn inference_mode_starts_at_last_bar() {
        let config = AgentConfig::named("test");
        let env = TradingEnv::new(
            make_frame(250),
            &config,
            60,
            EnvOptions {
                inference_mode: true,
                seed: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(env.current_step, 249);
    }

    #[test]
    fn buy_sell_cycle() {
        let mut env = make_env(300, false);
        let initial_cash = env.cash;
        env.step(Action::BuyMedium);
        assert!(env.shares_held > 0.0);
        assert!(env.cash < initial_cash);
        env.step(Action::SellAll);
        assert_eq!(env.shares_held, 0.0);
    }

    #[test]
    fn buy_sizes_ascending() {
        let mut held = Vec::new();
        for action in [Action::BuySmall, Action::BuyMedium, Action::BuyLarge] {
            let mut env = make_env(300, false);
            env.step(action);
            held.push(env.shares_held);
        }
        assert!(held[0] <= held[1] && held[1] <= held[2]);
    }

    #[test]
    fn buy_fraction_capped_by_max_position_size() {
        let mut config = AgentConfig::named("test");
        config.max_position_size = 0.10;
        let mut env = TradingEnv::new(
            make_frame(300),
            &config,
            60,
            EnvOptions {
                slippage_model: Some(SlippageModel::None),
                seed: Some(7),
                ..Default::default()
            },
        )
        .unwrap();
        let cash = env.cash;
        env.step(Action::BuyLarge);
        // Large = 50% but cap is 10% of cash.
        let spent = cash - env.cash;
        assert!(spent <= cash * 0.11);
    }

    #[test]
    fn short_cover_cycle_restores_flat_book() {
        let mut env = make_env(300, true);
        env.step(Action::ShortLarge);
        assert!(env.shares_shorted > 0.0);
        assert!(env.short_collateral > 0.0);
        env.step(Action::CoverAll);
        assert_eq!(env.shares_shorted, 0.0);
        assert_eq!(env.short_collateral, 0.0);
        assert_eq!(env.short_entry_price, 0.0);
    }

    #[test]
    fn short_actions_ignored_when_disabled() {
        let mut env = make_env(300, false);
        env.step(Action::ShortLarge);
        assert_eq!(env.shares_shorted, 0.0);
    }

    #[test]
    fn portfolio_value_non_negative_through_episode() {
        let mut env = make_env(300, true);
        let actions = [
            Action::BuyMedium,
            Action::Hold,
            Action::SellAll,
            Action::ShortMedium,
            Action::Hold,
            Action::CoverAll,
        ];
        let mut i = 0;
        loop {
            let result = env.step(actions[i % actions.len()]);
            assert!(
                result.info.portfolio_value >= 0.0,
                "portfolio value went negative"
            );
            if result.terminated {
                break;
            }
            i += 1;
        }
    }

    #[test]
    fn episode_terminates_at_last_bar() {
        let mut env = make_env(120, false);
        let mut steps = 0;
        loop {
            let result = env.step(Action::Hold);
            steps += 1;
            if result.terminated {
                break;
            }
            assert!(steps < 200, "episode failed to terminate");
        }
    }

    #[test]
    fn reset_clears_state() {
        let mut env = make_env(300, false);
        env.step(Action::BuyLarge);
        env.reset(true);
        assert_eq!(env.shares_held, 0.0);
        assert!((env.cash - env.initial_balance).abs() < f64::EPSILON);
        assert!(env.trade_history().is_empty());
        assert!(env.benchmark_start_price > 0.0);
    }

    #[test]
    fn stop_loss_closes_long_with_penalty() {
        // Crash frame: price halves right after the window.
        let bars: Vec<Bar> = (0..200)
            .map(|i| {
                let base = if i < 100 { 100.0 } else { 40.0 };
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
        let frame = calculate_indicators(&bars).unwrap();
        let config = AgentConfig::named("test");
        let mut env = TradingEnv::new(
            frame,
            &config,
            60,
            EnvOptions {
                slippage_model: Some(SlippageModel::None),
                seed: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        // Pin the start right before the crash.
        env.current_step = 99;
        env.step(Action::BuyLarge);
        assert!(env.shares_held > 0.0);
        // Next step lands on the crash bar: unrealised return -60% <= -5%.
        let result = env.step(Action::Hold);
        assert_eq!(env.shares_held, 0.0, "stop loss should flatten the long");
        assert!(result.reward < 0.0);
    }

    #[test]
    fn consistency_bonus_rewards_positive_streak() {
        let env = make_env(300, false);
        let mut steady = env;
        steady.daily_returns = vec![0.004; 15];
        let r_steady = steady.step_reward(0.004, 0.0, 0.0, 0.0);

        let mut mixed = make_env(300, false);
        mixed.daily_returns = vec![0.01, -0.01, 0.01, -0.01, 0.01, -0.01, 0.01, -0.01, 0.01, -0.01];
        let r_mixed = mixed.step_reward(0.0, 0.0, 0.0, 0.0);

        assert!(r_steady > r_mixed);
    }

    #[test]
    fn drawdown_penalty_applies_above_threshold() {
        let env = make_env(300, false);
        let low = env.step_reward(0.0, 0.05, 0.0, 0.0);
        let high = env.step_reward(0.0, 0.20, 0.0, 0.0);
        assert!(high < low);
    }

    #[test]
    fn info_metrics_present() {
        let mut env = make_env(300, false);
        for _ in 0..40 {
            env.step(Action::Hold);
        }
        let info = env.info();
        assert!(info.sharpe_ratio.is_finite());
        assert!(info.sortino_ratio.is_finite());
        assert!(info.calmar_ratio.is_finite());
        assert!(info.benchmark_return_pct.is_finite());
        assert!(info.alpha_pct.is_finite());
    }
}
