// =============================================================================
// Agent & Trader Configuration
// =============================================================================
//
// Two explicit config structs drive the whole service:
//
//   AgentConfig  — persisted alongside a trained policy. Carries the trading
//                  profile, capital limits, RL hyperparameters and the policy
//                  architecture. The copy inside metadata.json is
//                  authoritative for architecture on continue-training.
//   TraderConfig — runtime knobs of one live trader: watchlist, schedule,
//                  signal weights, decision thresholds, sizing mode,
//                  cooldowns and self-training cadence.
//
// The backend stores trader settings as a nested "personality" JSON tree;
// `TraderConfig::from_personality` is the single adapter that flattens it.
// Unknown fields are ignored with a warning.
//
// Every field has a serde default so older JSON keeps deserialising.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::TradingHorizon;

// =============================================================================
// Profile enums
// =============================================================================

/// Typical holding periods for trading strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldingPeriod {
    Scalping,
    Intraday,
    SwingShort,
    SwingMedium,
    PositionShort,
    PositionMedium,
    PositionLong,
    Investor,
}

impl Default for HoldingPeriod {
    fn default() -> Self {
        Self::SwingShort
    }
}

impl HoldingPeriod {
    /// Target holding time in environment steps (daily bars).
    pub fn target_steps(&self) -> usize {
        match self {
            Self::Scalping => 4,
            Self::Intraday => 8,
            Self::SwingShort => 3,
            Self::SwingMedium => 5,
            Self::PositionShort => 10,
            Self::PositionMedium => 20,
            Self::PositionLong => 60,
            Self::Investor => 120,
        }
    }
}

/// Risk appetite levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
    VeryAggressive,
}

impl Default for RiskProfile {
    fn default() -> Self {
        Self::Moderate
    }
}

impl RiskProfile {
    /// Multiplier applied to buy/short fractions in the environment.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Conservative => 0.5,
            Self::Moderate => 1.0,
            Self::Aggressive => 1.5,
            Self::VeryAggressive => 2.0,
        }
    }
}

/// Trading approach preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingStyle {
    TrendFollowing,
    MeanReversion,
    Momentum,
    Breakout,
    Contrarian,
    Mixed,
}

impl Default for TradingStyle {
    fn default() -> Self {
        Self::Mixed
    }
}

/// Broker fee profiles, matching the backend's fee tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerProfile {
    #[serde(rename = "discount")]
    Discount,
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "premium")]
    Premium,
    #[serde(rename = "marketMaker")]
    MarketMaker,
    #[serde(rename = "flatex")]
    Flatex,
    #[serde(rename = "ingdiba")]
    IngDiba,
}

impl Default for BrokerProfile {
    fn default() -> Self {
        Self::Standard
    }
}

/// Slippage model for simulated executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlippageModel {
    None,
    Fixed,
    Proportional,
    Volume,
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self::Proportional
    }
}

/// Position sizing mode for the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSizing {
    Fixed,
    Kelly,
    Volatility,
}

impl Default for PositionSizing {
    fn default() -> Self {
        Self::Fixed
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_initial_balance() -> f64 {
    100_000.0
}

fn default_max_position_size() -> f64 {
    0.25
}

fn default_max_positions() -> u32 {
    5
}

fn default_stop_loss_percent() -> f64 {
    0.05
}

fn default_take_profit_percent() -> f64 {
    0.10
}

fn default_trailing_stop_distance() -> f64 {
    0.03
}

fn default_symbols() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "GOOGL".to_string(),
        "AMZN".to_string(),
        "TSLA".to_string(),
    ]
}

fn default_learning_rate() -> f64 {
    0.0003
}

fn default_gamma() -> f64 {
    0.99
}

fn default_ent_coef() -> f64 {
    0.01
}

fn default_d_model() -> usize {
    256
}

fn default_n_heads() -> usize {
    8
}

fn default_n_layers() -> usize {
    4
}

fn default_d_ff() -> usize {
    512
}

fn default_dropout() -> f64 {
    0.1
}

fn default_slippage_bps() -> f64 {
    5.0
}

// =============================================================================
// AgentConfig
// =============================================================================

/// Configuration for a trading agent, persisted with the trained policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique name for this agent profile.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,

    // --- Trading profile -----------------------------------------------------
    #[serde(default)]
    pub holding_period: HoldingPeriod,
    #[serde(default)]
    pub risk_profile: RiskProfile,
    #[serde(default)]
    pub trading_style: TradingStyle,
    #[serde(default)]
    pub broker_profile: BrokerProfile,

    // --- Capital management --------------------------------------------------
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    /// Maximum position size as a fraction of the portfolio.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    // --- Risk management -----------------------------------------------------
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,
    #[serde(default)]
    pub trailing_stop: bool,
    #[serde(default = "default_trailing_stop_distance")]
    pub trailing_stop_distance: f64,

    // --- Training symbols ----------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- RL hyperparameters --------------------------------------------------
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_ent_coef")]
    pub ent_coef: f64,

    // --- Policy architecture -------------------------------------------------
    // These fields are preserved across continue-training sessions; only the
    // trading fields above may be overridden by a newer config.
    #[serde(default)]
    pub use_transformer_policy: bool,
    #[serde(default = "default_d_model")]
    pub transformer_d_model: usize,
    #[serde(default = "default_n_heads")]
    pub transformer_n_heads: usize,
    #[serde(default = "default_n_layers")]
    pub transformer_n_layers: usize,
    #[serde(default = "default_d_ff")]
    pub transformer_d_ff: usize,
    #[serde(default = "default_dropout")]
    pub transformer_dropout: f64,

    // --- Short selling & slippage -------------------------------------------
    #[serde(default)]
    pub enable_short_selling: bool,
    #[serde(default)]
    pub slippage_model: SlippageModel,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,

    /// Observation window in bars; `None` falls back to the service default.
    #[serde(default)]
    pub lookback_window: Option<usize>,
}

impl AgentConfig {
    /// Minimal config with defaults for everything but the name.
    pub fn named(name: impl Into<String>) -> Self {
        serde_json::from_value(serde_json::json!({ "name": name.into() }))
            .expect("default AgentConfig must deserialise")
    }

    /// Merge the trading fields of `update` into a copy of `self`, keeping
    /// the architecture fields (and RL hyperparameters) untouched. Used on
    /// continue-training so a newer request cannot silently change the
    /// network shape of a persisted policy.
    pub fn with_trading_fields_from(&self, update: &AgentConfig) -> AgentConfig {
        let mut merged = self.clone();
        merged.initial_balance = update.initial_balance;
        merged.max_position_size = update.max_position_size;
        merged.stop_loss_percent = update.stop_loss_percent;
        merged.take_profit_percent = update.take_profit_percent;
        merged
    }
}

// =============================================================================
// Preset agent profiles
// =============================================================================

/// Predefined agent profiles for common trading styles.
pub fn preset_agent_configs() -> Vec<AgentConfig> {
    let mut presets = Vec::new();

    let mut c = AgentConfig::named("conservative_swing");
    c.description = Some("Conservative swing trader - low risk, medium holding period".into());
    c.holding_period = HoldingPeriod::SwingMedium;
    c.risk_profile = RiskProfile::Conservative;
    c.trading_style = TradingStyle::TrendFollowing;
    c.max_position_size = 0.15;
    c.max_positions = 3;
    c.stop_loss_percent = 0.03;
    c.take_profit_percent = 0.08;
    c.broker_profile = BrokerProfile::Discount;
    presets.push(c);

    let mut c = AgentConfig::named("aggressive_momentum");
    c.description = Some("Aggressive momentum trader - high risk, short holding period".into());
    c.holding_period = HoldingPeriod::SwingShort;
    c.risk_profile = RiskProfile::Aggressive;
    c.trading_style = TradingStyle::Momentum;
    c.max_position_size = 0.35;
    c.max_positions = 5;
    c.stop_loss_percent = 0.07;
    c.take_profit_percent = 0.15;
    c.broker_profile = BrokerProfile::Discount;
    c.ent_coef = 0.02;
    presets.push(c);

    let mut c = AgentConfig::named("day_trader");
    c.description = Some("Intraday trader - quick trades, mean reversion".into());
    c.holding_period = HoldingPeriod::Intraday;
    c.trading_style = TradingStyle::MeanReversion;
    c.max_position_size = 0.20;
    c.max_positions = 10;
    c.stop_loss_percent = 0.02;
    c.take_profit_percent = 0.04;
    c.broker_profile = BrokerProfile::MarketMaker;
    presets.push(c);

    let mut c = AgentConfig::named("position_investor");
    c.description = Some("Long-term position trader - low turnover, trend following".into());
    c.holding_period = HoldingPeriod::PositionLong;
    c.risk_profile = RiskProfile::Conservative;
    c.trading_style = TradingStyle::TrendFollowing;
    c.max_position_size = 0.30;
    c.max_positions = 4;
    c.stop_loss_percent = 0.10;
    c.take_profit_percent = 0.25;
    c.trailing_stop = true;
    c.trailing_stop_distance = 0.05;
    c.broker_profile = BrokerProfile::Premium;
    c.gamma = 0.995;
    presets.push(c);

    let mut c = AgentConfig::named("balanced_trader");
    c.description = Some("Balanced approach - moderate risk and holding period".into());
    c.holding_period = HoldingPeriod::SwingShort;
    c.max_position_size = 0.20;
    c.max_positions = 5;
    presets.push(c);

    presets
}

// =============================================================================
// TraderConfig
// =============================================================================

fn default_max_total_exposure() -> f64 {
    0.80
}

fn default_trader_max_positions() -> u32 {
    10
}

fn default_reserve_cash() -> f64 {
    0.10
}

fn default_max_daily_loss() -> f64 {
    0.05
}

fn default_max_drawdown() -> f64 {
    0.15
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_cooldown_minutes() -> i64 {
    30
}

fn default_signal_weight() -> f64 {
    0.25
}

fn default_min_confidence() -> f64 {
    0.65
}

fn default_true() -> bool {
    true
}

fn default_fixed_position_percent() -> f64 {
    0.10
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_max_short_positions() -> u32 {
    3
}

fn default_max_short_exposure() -> f64 {
    0.30
}

fn default_self_training_interval() -> i64 {
    60
}

fn default_self_training_timesteps() -> usize {
    10_000
}

fn default_trading_days() -> Vec<String> {
    ["mon", "tue", "wed", "thu", "fri"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_trading_start() -> String {
    "09:00".to_string()
}

fn default_trading_end() -> String {
    "17:30".to_string()
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_check_interval() -> u64 {
    60
}

fn default_market_buffer() -> i64 {
    15
}

fn default_pause_on_high_vix() -> f64 {
    30.0
}

fn default_min_signal_agreement() -> crate::types::Agreement {
    crate::types::Agreement::Moderate
}

/// Runtime configuration of one live trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    pub trader_id: i64,
    pub name: String,

    // --- Capital management --------------------------------------------------
    #[serde(default = "default_initial_balance")]
    pub initial_budget: f64,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,
    #[serde(default = "default_trader_max_positions")]
    pub max_positions: u32,
    #[serde(default = "default_reserve_cash")]
    pub reserve_cash: f64,

    // --- Risk management -----------------------------------------------------
    #[serde(default)]
    pub risk_tolerance: RiskProfile,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Minutes a symbol stays suppressed after a position close.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,

    // --- Signal weights ------------------------------------------------------
    #[serde(default = "default_signal_weight")]
    pub ml_weight: f64,
    #[serde(default = "default_signal_weight")]
    pub rl_weight: f64,
    #[serde(default = "default_signal_weight")]
    pub sentiment_weight: f64,
    #[serde(default = "default_signal_weight")]
    pub technical_weight: f64,
    #[serde(default)]
    pub rl_agent_name: Option<String>,

    // --- Decision thresholds -------------------------------------------------
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_true")]
    pub adaptive_threshold: bool,
    #[serde(default = "default_true")]
    pub require_multiple_confirmation: bool,
    #[serde(default = "default_min_signal_agreement")]
    pub min_signal_agreement: crate::types::Agreement,

    // --- Position sizing -----------------------------------------------------
    #[serde(default)]
    pub position_sizing: PositionSizing,
    #[serde(default = "default_fixed_position_percent")]
    pub fixed_position_percent: f64,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,

    // --- Stop loss & take profit ---------------------------------------------
    #[serde(default = "default_true")]
    pub use_stop_loss: bool,
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
    #[serde(default = "default_true")]
    pub use_take_profit: bool,
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,

    // --- Trading horizon -----------------------------------------------------
    #[serde(default)]
    pub trading_horizon: TradingHorizon,

    // --- Short selling -------------------------------------------------------
    #[serde(default)]
    pub allow_short_selling: bool,
    #[serde(default = "default_max_short_positions")]
    pub max_short_positions: u32,
    #[serde(default = "default_max_short_exposure")]
    pub max_short_exposure: f64,

    // --- Self-training -------------------------------------------------------
    #[serde(default = "default_true")]
    pub self_training_enabled: bool,
    #[serde(default = "default_self_training_interval")]
    pub self_training_interval_minutes: i64,
    #[serde(default = "default_self_training_timesteps")]
    pub self_training_timesteps: usize,

    // --- Schedule ------------------------------------------------------------
    #[serde(default = "default_true")]
    pub schedule_enabled: bool,
    #[serde(default = "default_trading_days")]
    pub trading_days: Vec<String>,
    #[serde(default = "default_trading_start")]
    pub trading_start: String,
    #[serde(default = "default_trading_end")]
    pub trading_end: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    /// Minutes to avoid after market open.
    #[serde(default = "default_market_buffer")]
    pub avoid_market_open: i64,
    /// Minutes to avoid before market close.
    #[serde(default = "default_market_buffer")]
    pub avoid_market_close: i64,

    // --- Market conditions ---------------------------------------------------
    #[serde(default = "default_pause_on_high_vix")]
    pub pause_on_high_vix: f64,

    // --- Watchlist -----------------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

impl TraderConfig {
    /// Minimal config with defaults for everything but the identity.
    pub fn new(trader_id: i64, name: impl Into<String>) -> Self {
        serde_json::from_value(serde_json::json!({
            "trader_id": trader_id,
            "name": name.into(),
        }))
        .expect("default TraderConfig must deserialise")
    }

    /// Build an [`AgentConfig`] for self-training from this trader's
    /// budget, sizing and SL/TP. The trainer merges it with the persisted
    /// architecture, so only trading fields matter here.
    pub fn self_training_agent_config(&self, agent_name: &str) -> AgentConfig {
        let mut cfg = AgentConfig::named(agent_name);
        cfg.initial_balance = self.initial_budget;
        cfg.max_position_size = self.max_position_size;
        cfg.stop_loss_percent = self.stop_loss_percent;
        cfg.take_profit_percent = self.take_profit_percent;
        cfg
    }

    /// Flatten the backend's nested "personality" tree into a TraderConfig.
    ///
    /// Percent-denominated backend fields are converted to fractions here.
    /// Unknown keys inside the known sections are ignored with a warning so
    /// a newer backend never breaks trader resume.
    pub fn from_personality(
        trader_id: i64,
        name: impl Into<String>,
        personality: &serde_json::Value,
    ) -> Self {
        let mut cfg = Self::new(trader_id, name);

        let section = |key: &str| personality.get(key).cloned().unwrap_or_default();
        let schedule = section("schedule");
        let signals = section("signals");
        let capital = section("capital");
        let risk = section("risk");
        let trading = section("trading");
        let rl = section("rl");

        let known_sections = [
            "schedule", "signals", "capital", "risk", "trading", "rl", "ml", "watchlist",
            "rlAgentName",
        ];
        if let Some(obj) = personality.as_object() {
            for key in obj.keys() {
                if !known_sections.contains(&key.as_str()) {
                    warn!(trader_id, field = %key, "ignoring unknown personality field");
                }
            }
        }

        if let Some(symbols) = personality
            .pointer("/watchlist/symbols")
            .and_then(|v| v.as_array())
        {
            cfg.symbols = symbols
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect();
        }

        // Schedule
        if let Some(v) = schedule.get("enabled").and_then(|v| v.as_bool()) {
            cfg.schedule_enabled = v;
        }
        if let Some(v) = schedule.get("checkIntervalSeconds").and_then(|v| v.as_u64()) {
            cfg.check_interval_seconds = v;
        }
        if let Some(v) = schedule.get("tradingStart").and_then(|v| v.as_str()) {
            cfg.trading_start = v.to_string();
        }
        if let Some(v) = schedule.get("tradingEnd").and_then(|v| v.as_str()) {
            cfg.trading_end = v.to_string();
        }
        if let Some(v) = schedule.get("timezone").and_then(|v| v.as_str()) {
            cfg.timezone = v.to_string();
        }
        if let Some(days) = schedule.get("tradingDays").and_then(|v| v.as_array()) {
            cfg.trading_days = days
                .iter()
                .filter_map(|d| d.as_str().map(str::to_string))
                .collect();
        }
        if let Some(v) = schedule
            .get("avoidMarketOpenMinutes")
            .and_then(|v| v.as_i64())
        {
            cfg.avoid_market_open = v;
        }
        if let Some(v) = schedule
            .get("avoidMarketCloseMinutes")
            .and_then(|v| v.as_i64())
        {
            cfg.avoid_market_close = v;
        }

        // Signal weights
        if let Some(w) = signals.get("weights") {
            if let Some(v) = w.get("ml").and_then(|v| v.as_f64()) {
                cfg.ml_weight = v;
            }
            if let Some(v) = w.get("rl").and_then(|v| v.as_f64()) {
                cfg.rl_weight = v;
            }
            if let Some(v) = w.get("sentiment").and_then(|v| v.as_f64()) {
                cfg.sentiment_weight = v;
            }
            if let Some(v) = w.get("technical").and_then(|v| v.as_f64()) {
                cfg.technical_weight = v;
            }
        }
        if let Some(v) = signals
            .get("requireMultipleConfirmation")
            .and_then(|v| v.as_bool())
        {
            cfg.require_multiple_confirmation = v;
        }
        if let Some(v) = signals.get("minSignalAgreement").and_then(|v| v.as_str()) {
            if let Ok(a) = serde_json::from_value(serde_json::Value::String(v.to_string())) {
                cfg.min_signal_agreement = a;
            }
        }

        // Decision thresholds
        if let Some(v) = trading.get("minConfidence").and_then(|v| v.as_f64()) {
            cfg.min_confidence = v;
        }
        if let Some(v) = trading.get("maxOpenPositions").and_then(|v| v.as_u64()) {
            cfg.max_positions = v as u32;
        }
        if let Some(v) = trading.get("tradingHorizon").and_then(|v| v.as_str()) {
            if let Ok(h) = serde_json::from_value(serde_json::Value::String(v.to_string())) {
                cfg.trading_horizon = h;
            }
        }
        if let Some(v) = personality.get("rlAgentName").and_then(|v| v.as_str()) {
            cfg.rl_agent_name = Some(v.to_string());
        }

        // Capital (percent fields arrive as whole percents)
        if let Some(v) = capital.get("initialBudget").and_then(|v| v.as_f64()) {
            cfg.initial_budget = v;
        }
        if let Some(v) = capital.get("maxPositionSize").and_then(|v| v.as_f64()) {
            cfg.max_position_size = v / 100.0;
        }
        if let Some(v) = capital.get("reserveCashPercent").and_then(|v| v.as_f64()) {
            cfg.reserve_cash = v / 100.0;
        }

        // Risk (percent fields arrive as whole percents)
        if let Some(v) = risk.get("tolerance").and_then(|v| v.as_str()) {
            if let Ok(t) = serde_json::from_value(serde_json::Value::String(v.to_string())) {
                cfg.risk_tolerance = t;
            }
        }
        if let Some(v) = risk.get("maxDrawdown").and_then(|v| v.as_f64()) {
            cfg.max_drawdown = v / 100.0;
        }
        if let Some(v) = risk.get("stopLossPercent").and_then(|v| v.as_f64()) {
            cfg.stop_loss_percent = v / 100.0;
        }
        if let Some(v) = risk.get("takeProfitPercent").and_then(|v| v.as_f64()) {
            cfg.take_profit_percent = v / 100.0;
        }
        if let Some(v) = risk.get("allowShortSelling").and_then(|v| v.as_bool()) {
            cfg.allow_short_selling = v;
        }
        if let Some(v) = risk.get("maxShortPositions").and_then(|v| v.as_u64()) {
            cfg.max_short_positions = v as u32;
        }
        if let Some(v) = risk.get("maxShortExposure").and_then(|v| v.as_f64()) {
            cfg.max_short_exposure = v;
        }

        // Self-training
        if let Some(v) = rl.get("selfTrainingEnabled").and_then(|v| v.as_bool()) {
            cfg.self_training_enabled = v;
        }
        if let Some(v) = rl
            .get("selfTrainingIntervalMinutes")
            .and_then(|v| v.as_i64())
        {
            cfg.self_training_interval_minutes = v;
        }
        if let Some(v) = rl.get("selfTrainingTimesteps").and_then(|v| v.as_u64()) {
            cfg.self_training_timesteps = v as usize;
        }

        cfg
    }

    /// Sum of the four signal weights. Not enforced to be 1.0; logged at
    /// trader start so a misconfigured tree is visible.
    pub fn weight_sum(&self) -> f64 {
        self.ml_weight + self.rl_weight + self.sentiment_weight + self.technical_weight
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_defaults() {
        let cfg = AgentConfig::named("test");
        assert_eq!(cfg.name, "test");
        assert!((cfg.initial_balance - 100_000.0).abs() < f64::EPSILON);
        assert!((cfg.max_position_size - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.max_positions, 5);
        assert!((cfg.stop_loss_percent - 0.05).abs() < f64::EPSILON);
        assert!((cfg.take_profit_percent - 0.10).abs() < f64::EPSILON);
        assert!(!cfg.use_transformer_policy);
        assert_eq!(cfg.transformer_d_model, 256);
        assert_eq!(cfg.transformer_n_heads, 8);
        assert!(!cfg.enable_short_selling);
        assert_eq!(cfg.slippage_model, SlippageModel::Proportional);
        assert!((cfg.slippage_bps - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn agent_config_partial_json_fills_defaults() {
        let cfg: AgentConfig =
            serde_json::from_str(r#"{ "name": "x", "use_transformer_policy": true }"#).unwrap();
        assert!(cfg.use_transformer_policy);
        assert_eq!(cfg.transformer_n_layers, 4);
        assert_eq!(cfg.holding_period, HoldingPeriod::SwingShort);
    }

    #[test]
    fn trading_field_merge_preserves_architecture() {
        let mut saved = AgentConfig::named("a");
        saved.use_transformer_policy = true;
        saved.transformer_d_model = 128;
        saved.learning_rate = 0.001;

        let mut update = AgentConfig::named("a");
        update.use_transformer_policy = false;
        update.transformer_d_model = 64;
        update.initial_balance = 200_000.0;
        update.stop_loss_percent = 0.02;

        let merged = saved.with_trading_fields_from(&update);
        assert!(merged.use_transformer_policy);
        assert_eq!(merged.transformer_d_model, 128);
        assert!((merged.learning_rate - 0.001).abs() < 1e-12);
        assert!((merged.initial_balance - 200_000.0).abs() < f64::EPSILON);
        assert!((merged.stop_loss_percent - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn holding_period_target_steps() {
        assert_eq!(HoldingPeriod::Scalping.target_steps(), 4);
        assert_eq!(HoldingPeriod::SwingMedium.target_steps(), 5);
        assert_eq!(HoldingPeriod::Investor.target_steps(), 120);
    }

    #[test]
    fn risk_profile_multipliers() {
        assert!((RiskProfile::Conservative.multiplier() - 0.5).abs() < f64::EPSILON);
        assert!((RiskProfile::Moderate.multiplier() - 1.0).abs() < f64::EPSILON);
        assert!((RiskProfile::Aggressive.multiplier() - 1.5).abs() < f64::EPSILON);
        assert!((RiskProfile::VeryAggressive.multiplier() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn broker_profile_serde_names() {
        assert_eq!(
            serde_json::to_string(&BrokerProfile::MarketMaker).unwrap(),
            "\"marketMaker\""
        );
        let p: BrokerProfile = serde_json::from_str("\"ingdiba\"").unwrap();
        assert_eq!(p, BrokerProfile::IngDiba);
    }

    #[test]
    fn presets_have_expected_profiles() {
        let presets = preset_agent_configs();
        assert_eq!(presets.len(), 5);
        let names: Vec<&str> = presets.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"conservative_swing"));
        assert!(names.contains(&"position_investor"));
        let investor = presets
            .iter()
            .find(|p| p.name == "position_investor")
            .unwrap();
        assert!(investor.trailing_stop);
        assert!((investor.gamma - 0.995).abs() < 1e-12);
    }

    #[test]
    fn trader_config_defaults() {
        let cfg = TraderConfig::new(1, "test");
        assert!((cfg.min_confidence - 0.65).abs() < f64::EPSILON);
        assert!(cfg.adaptive_threshold);
        assert_eq!(cfg.cooldown_minutes, 30);
        assert_eq!(cfg.trading_horizon, TradingHorizon::Day);
        assert_eq!(cfg.position_sizing, PositionSizing::Fixed);
        assert!((cfg.fixed_position_percent - 0.10).abs() < f64::EPSILON);
        assert!((cfg.max_total_exposure - 0.80).abs() < f64::EPSILON);
        assert!((cfg.weight_sum() - 1.0).abs() < 1e-9);
        assert_eq!(cfg.timezone, "Europe/Berlin");
    }

    #[test]
    fn personality_adapter_flattens_tree() {
        let personality = serde_json::json!({
            "watchlist": { "symbols": ["SAP", "BMW"] },
            "schedule": {
                "enabled": true,
                "checkIntervalSeconds": 120,
                "tradingStart": "08:00",
                "timezone": "America/New_York"
            },
            "signals": {
                "weights": { "ml": 0.4, "rl": 0.3, "sentiment": 0.1, "technical": 0.2 },
                "requireMultipleConfirmation": false
            },
            "capital": { "initialBudget": 50000.0, "maxPositionSize": 20, "reserveCashPercent": 5 },
            "risk": {
                "maxDrawdown": 10,
                "stopLossPercent": 3,
                "takeProfitPercent": 6,
                "allowShortSelling": true,
                "maxShortPositions": 2
            },
            "trading": { "minConfidence": 0.7, "maxOpenPositions": 8 },
            "rl": { "selfTrainingEnabled": false, "selfTrainingTimesteps": 5000 },
            "rlAgentName": "swing_bot"
        });

        let cfg = TraderConfig::from_personality(7, "Resumed", &personality);
        assert_eq!(cfg.trader_id, 7);
        assert_eq!(cfg.symbols, vec!["SAP", "BMW"]);
        assert_eq!(cfg.check_interval_seconds, 120);
        assert_eq!(cfg.trading_start, "08:00");
        assert_eq!(cfg.timezone, "America/New_York");
        assert!((cfg.ml_weight - 0.4).abs() < f64::EPSILON);
        assert!(!cfg.require_multiple_confirmation);
        assert!((cfg.initial_budget - 50_000.0).abs() < f64::EPSILON);
        assert!((cfg.max_position_size - 0.20).abs() < f64::EPSILON);
        assert!((cfg.reserve_cash - 0.05).abs() < f64::EPSILON);
        assert!((cfg.max_drawdown - 0.10).abs() < f64::EPSILON);
        assert!((cfg.stop_loss_percent - 0.03).abs() < f64::EPSILON);
        assert!(cfg.allow_short_selling);
        assert_eq!(cfg.max_short_positions, 2);
        assert!((cfg.min_confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.max_positions, 8);
        assert!(!cfg.self_training_enabled);
        assert_eq!(cfg.self_training_timesteps, 5000);
        assert_eq!(cfg.rl_agent_name.as_deref(), Some("swing_bot"));
    }

    #[test]
    fn personality_adapter_survives_empty_tree() {
        let cfg = TraderConfig::from_personality(1, "bare", &serde_json::json!({}));
        assert_eq!(cfg.symbols, default_symbols());
        assert!((cfg.min_confidence - 0.65).abs() < f64::EPSILON);
    }

    #[test]
    fn self_training_agent_config_copies_trading_fields() {
        let mut tc = TraderConfig::new(3, "t");
        tc.initial_budget = 42_000.0;
        tc.max_position_size = 0.15;
        tc.stop_loss_percent = 0.04;
        tc.take_profit_percent = 0.08;
        let ac = tc.self_training_agent_config("trader_3_agent");
        assert_eq!(ac.name, "trader_3_agent");
        assert!((ac.initial_balance - 42_000.0).abs() < f64::EPSILON);
        assert!((ac.max_position_size - 0.15).abs() < f64::EPSILON);
        assert!((ac.stop_loss_percent - 0.04).abs() < f64::EPSILON);
        assert!((ac.take_profit_percent - 0.08).abs() < f64::EPSILON);
    }
}
