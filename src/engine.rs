// =============================================================================
// Decision Engine — horizon-aware decision selection, sizing and SL/TP
// =============================================================================
//
// Pipeline per symbol:
//   1. Aggregate the four signal sources
//   2. Compute the adaptive confidence threshold
//   3. Select the decision against the horizon threshold table
//   4. Size the position (fixed / kelly / volatility, streak-aware)
//   5. Derive stop-loss and take-profit
//   6. Run the risk-check batch; apply its position scale factor
//   7. Emit a fully-reasoned TradingDecision
//
// Minimum-holding floors gate only engine-driven closes; the scheduler's
// SL/TP sweep bypasses them.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::agent_config::{PositionSizing, TraderConfig};
use crate::backend::{BackendClient, MarketData};
use crate::indicators::atr::atr_pct_last;
use crate::risk::{RiskCheckResult, RiskManager};
use crate::signals::{AggregatedSignal, SignalAggregator};
use crate::trainer::AgentTrainer;
use crate::types::{Agreement, DecisionType, PortfolioState, PositionSide};

/// Bounded trade-outcome history kept for streak-aware sizing.
const MAX_TRADE_HISTORY: usize = 100;

/// Score triggers for one trading horizon.
#[derive(Debug, Clone, Copy)]
pub struct HorizonThresholds {
    pub sell_strong: f64,
    pub sell_weak: f64,
    pub buy_strong: f64,
    pub short_trigger: f64,
}

/// Complete result of analysing one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct TradingDecision {
    pub id: String,
    pub symbol: String,
    pub decision_type: DecisionType,
    pub confidence: f64,
    pub weighted_score: f64,

    pub ml_score: Option<f64>,
    pub rl_score: Option<f64>,
    pub sentiment_score: Option<f64>,
    pub technical_score: Option<f64>,
    pub signal_agreement: Agreement,

    pub reasoning: serde_json::Value,
    pub summary_short: String,

    /// Whole shares; negative for shorts.
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,

    pub risk_checks_passed: bool,
    pub risk_warnings: Vec<String>,
    pub risk_blockers: Vec<String>,

    pub market_context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TradingDecision {
    /// Synthetic close emitted by the scheduler's SL/TP sweep: confidence
    /// 1.0, risk checks bypassed.
    pub fn sl_tp_close(
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        current_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        trigger: &str,
    ) -> Self {
        let trigger_price = if trigger == "stop_loss" {
            stop_loss
        } else {
            take_profit
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            decision_type: DecisionType::Close,
            confidence: 1.0,
            weighted_score: 0.0,
            ml_score: None,
            rl_score: None,
            sentiment_score: None,
            technical_score: None,
            signal_agreement: Agreement::Strong,
            reasoning: json!({
                "trigger": trigger,
                "trigger_price": trigger_price,
                "current_price": current_price,
                "side": side,
            }),
            summary_short: format!(
                "{}: Closing {side} {symbol} @ ${current_price:.2}",
                trigger.to_uppercase()
            ),
            quantity: Some(quantity.abs()),
            price: Some(current_price),
            stop_loss,
            take_profit,
            risk_checks_passed: true,
            risk_warnings: Vec::new(),
            risk_blockers: Vec::new(),
            market_context: json!({}),
            timestamp: Utc::now(),
        }
    }
}

/// Per-trader decision engine. Holds the streak state the adaptive threshold
/// and sizing consult.
pub struct TraderEngine {
    config: TraderConfig,
    aggregator: SignalAggregator,
    risk_manager: RiskManager,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    trade_history: Vec<f64>,
}

impl TraderEngine {
    pub fn new(
        config: TraderConfig,
        backend: Arc<BackendClient>,
        trainer: Arc<AgentTrainer>,
    ) -> Self {
        let aggregator = SignalAggregator::new(backend.clone(), trainer, config.clone());
        let risk_manager = RiskManager::new(config.clone(), backend);
        Self {
            config,
            aggregator,
            risk_manager,
            consecutive_wins: 0,
            consecutive_losses: 0,
            trade_history: Vec::new(),
        }
    }

    pub fn config(&self) -> &TraderConfig {
        &self.config
    }

    /// Analyse one symbol and produce a complete decision.
    pub async fn analyze_symbol(
        &self,
        symbol: &str,
        market: &MarketData,
        portfolio: &PortfolioState,
    ) -> TradingDecision {
        // 1. Signal fusion.
        let aggregated = self.aggregator.aggregate(symbol, market).await;

        // 2. Adaptive threshold.
        let threshold = self.adaptive_threshold(&aggregated, portfolio);

        // 3. Decision selection.
        let decision_type =
            self.determine_decision_type(&aggregated, threshold, portfolio, symbol);

        // 4. Sizing (risk scale factor applied after the checks).
        let current_price = market.current_price;
        let (position_size, _) = self.calculate_position_size(
            decision_type,
            current_price,
            aggregated.confidence,
            portfolio,
            Some(market),
        );

        // 5. SL/TP at entry.
        let (stop_loss, take_profit) = self.calculate_sl_tp(decision_type, current_price);

        // 6. Risk gating.
        let risk_result = self
            .risk_manager
            .check_all(
                symbol,
                decision_type,
                position_size,
                portfolio,
                self.consecutive_losses,
            )
            .await;

        // Scale down before rounding to whole shares. Close decisions carry
        // no quantity; the backend flattens the whole position.
        let sized = matches!(
            decision_type,
            DecisionType::Buy | DecisionType::Sell | DecisionType::Short
        );
        let scaled_size = position_size * risk_result.position_scale_factor;
        let quantity = if sized && current_price > 0.0 {
            let shares = (scaled_size / current_price).floor();
            if decision_type == DecisionType::Short {
                Some(-shares)
            } else {
                Some(shares)
            }
        } else {
            None
        };

        // 7. Reasoning + summary.
        let reasoning =
            self.build_reasoning(&aggregated, threshold, decision_type, &risk_result, portfolio);
        let summary = self.create_summary(symbol, decision_type, &aggregated, &risk_result);

        debug!(
            symbol,
            decision = %decision_type,
            score = aggregated.weighted_score,
            confidence = aggregated.confidence,
            threshold,
            "symbol analysed"
        );

        TradingDecision {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            decision_type,
            confidence: aggregated.confidence,
            weighted_score: aggregated.weighted_score,
            ml_score: Some(aggregated.ml_score),
            rl_score: Some(aggregated.rl_score),
            sentiment_score: Some(aggregated.sentiment_score),
            technical_score: Some(aggregated.technical_score),
            signal_agreement: aggregated.agreement,
            reasoning,
            summary_short: summary,
            quantity,
            price: if sized { Some(current_price) } else { None },
            stop_loss,
            take_profit,
            risk_checks_passed: risk_result.all_passed,
            risk_warnings: risk_result.warnings,
            risk_blockers: risk_result.blockers,
            market_context: aggregated.market_context,
            timestamp: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Adaptive threshold
    // -------------------------------------------------------------------------

    fn adaptive_threshold(
        &self,
        aggregated: &AggregatedSignal,
        portfolio: &PortfolioState,
    ) -> f64 {
        let base = self.config.min_confidence;
        if !self.config.adaptive_threshold {
            return base;
        }

        let mut threshold = base;

        // Shakier consensus demands more confidence.
        match aggregated.agreement {
            Agreement::Weak => threshold += 0.05,
            Agreement::Mixed => threshold += 0.10,
            _ => {}
        }

        // Losing day: be pickier.
        if portfolio.daily_pnl_pct < -2.0 {
            threshold += 0.10;
        }

        // Loss streak escalation.
        if self.consecutive_losses >= 3 {
            threshold += 0.05 * (self.consecutive_losses - 2) as f64;
        }

        // Anti-overconfidence after a sustained win streak.
        if self.consecutive_wins >= 5 {
            threshold += 0.02;
        }

        threshold.min(0.90)
    }

    // -------------------------------------------------------------------------
    // Horizon thresholds
    // -------------------------------------------------------------------------

    fn horizon_thresholds(&self) -> HorizonThresholds {
        use crate::types::TradingHorizon::*;
        match self.config.trading_horizon {
            Scalping => HorizonThresholds {
                sell_strong: -0.10,
                sell_weak: 0.05,
                buy_strong: 0.15,
                short_trigger: -0.12,
            },
            Day => HorizonThresholds {
                sell_strong: -0.20,
                sell_weak: 0.0,
                buy_strong: 0.25,
                short_trigger: -0.20,
            },
            Swing => HorizonThresholds {
                sell_strong: -0.35,
                sell_weak: -0.10,
                buy_strong: 0.30,
                short_trigger: -0.28,
            },
            Position => HorizonThresholds {
                sell_strong: -0.45,
                sell_weak: -0.20,
                buy_strong: 0.35,
                short_trigger: -0.35,
            },
        }
    }

    // -------------------------------------------------------------------------
    // Decision selection
    // -------------------------------------------------------------------------

    fn determine_decision_type(
        &self,
        aggregated: &AggregatedSignal,
        threshold: f64,
        portfolio: &PortfolioState,
        symbol: &str,
    ) -> DecisionType {
        let score = aggregated.weighted_score;
        let confidence = aggregated.confidence;
        let ht = self.horizon_thresholds();

        let position = portfolio.positions.get(symbol);
        // `side` is authoritative; quantity is always non-negative.
        let has_long = position
            .map(|p| p.quantity > 0.0 && p.side != PositionSide::Short)
            .unwrap_or(false);
        let has_short = position
            .map(|p| p.quantity > 0.0 && p.side == PositionSide::Short)
            .unwrap_or(false);

        // Minimum holding floor before an engine-driven close (SL/TP sweeps
        // bypass the engine entirely).
        if has_long || has_short {
            if let Some(minutes_held) = position.and_then(|p| minutes_since_open(p.opened_at.as_deref())) {
                if minutes_held < self.config.trading_horizon.min_holding_minutes() {
                    return DecisionType::Hold;
                }
            }
        }

        if confidence < threshold {
            return DecisionType::Skip;
        }

        if self.config.require_multiple_confirmation
            && aggregated.agreement.rank() < self.config.min_signal_agreement.rank()
        {
            return DecisionType::Skip;
        }

        if has_long {
            if score < ht.sell_strong {
                DecisionType::Sell
            } else if score < ht.sell_weak {
                DecisionType::Close
            } else {
                DecisionType::Hold
            }
        } else if has_short {
            // Inverse thresholds: a rising score is bad for the short.
            if score > -ht.sell_strong || score > -ht.sell_weak {
                DecisionType::Close
            } else {
                DecisionType::Hold
            }
        } else {
            // No position: strictly-greater comparison at the buy boundary.
            if score > ht.buy_strong {
                DecisionType::Buy
            } else if score > 0.0 {
                if confidence > threshold + 0.10 {
                    DecisionType::Buy
                } else {
                    DecisionType::Hold
                }
            } else if score < ht.short_trigger {
                if self.config.allow_short_selling && self.can_open_short(portfolio) {
                    DecisionType::Short
                } else {
                    DecisionType::Hold
                }
            } else if score < ht.short_trigger + 0.10 {
                if self.config.allow_short_selling
                    && confidence > threshold + 0.15
                    && self.can_open_short(portfolio)
                {
                    DecisionType::Short
                } else {
                    DecisionType::Hold
                }
            } else {
                DecisionType::Hold
            }
        }
    }

    /// Short-quota: position count and exposure judged by `side`.
    fn can_open_short(&self, portfolio: &PortfolioState) -> bool {
        if portfolio.short_count() >= self.config.max_short_positions as usize {
            return false;
        }
        let total_value = if portfolio.total_value > 0.0 {
            portfolio.total_value
        } else {
            self.config.initial_budget
        };
        portfolio.short_exposure() / total_value <= self.config.max_short_exposure
    }

    // -------------------------------------------------------------------------
    // Position sizing
    // -------------------------------------------------------------------------

    /// Returns (dollar size, whole-share quantity, negative for shorts)
    /// before the risk manager's scale factor.
    fn calculate_position_size(
        &self,
        decision_type: DecisionType,
        current_price: f64,
        confidence: f64,
        portfolio: &PortfolioState,
        market: Option<&MarketData>,
    ) -> (f64, f64) {
        if !matches!(
            decision_type,
            DecisionType::Buy | DecisionType::Sell | DecisionType::Short
        ) || current_price <= 0.0
        {
            return (0.0, 0.0);
        }

        let budget = self.config.initial_budget;
        let mut size = match self.config.position_sizing {
            PositionSizing::Fixed => budget * self.config.fixed_position_percent,
            PositionSizing::Kelly => {
                // Kelly = (p·b − q) / b with p from confidence, b = 2.
                let win_prob = (confidence + 1.0) / 2.0;
                let loss_prob = 1.0 - win_prob;
                let b = 2.0;
                let kelly_pct = ((win_prob * b - loss_prob) / b).max(0.0) * self.config.kelly_fraction;
                budget * kelly_pct
            }
            PositionSizing::Volatility => {
                let atr_pct = market.and_then(|m| atr_pct_last(&m.bars, 14));
                match atr_pct {
                    Some(atr_pct) if atr_pct > 0.0 => {
                        // ATR-inverse around a 2% reference band.
                        let factor = (2.0 / atr_pct).clamp(0.25, 2.0);
                        budget * self.config.fixed_position_percent * factor
                    }
                    _ => budget * self.config.fixed_position_percent * confidence,
                }
            }
        };

        // Shorts carry borrow risk: 30% smaller regardless of sizing mode.
        if decision_type == DecisionType::Short {
            size *= 0.7;
        }

        // Loss-streak shrinkage: −20% per loss beyond two, floored at 50%.
        if self.consecutive_losses >= 3 {
            let shrink = (1.0 - 0.2 * (self.consecutive_losses - 2) as f64).max(0.5);
            size *= shrink;
        }

        // Cash buffer and the hard cap.
        size = size.min(portfolio.cash * 0.95);
        size = size.min(budget * self.config.max_position_size);

        let mut quantity = (size / current_price).floor();
        if decision_type == DecisionType::Short {
            quantity = -quantity;
        }
        let actual_size = quantity.abs() * current_price;

        (actual_size, quantity)
    }

    // -------------------------------------------------------------------------
    // SL/TP derivation
    // -------------------------------------------------------------------------

    fn calculate_sl_tp(
        &self,
        decision_type: DecisionType,
        current_price: f64,
    ) -> (Option<f64>, Option<f64>) {
        if !decision_type.opens_position() || current_price <= 0.0 {
            return (None, None);
        }
        let sl_pct = self.config.stop_loss_percent;
        let tp_pct = self.config.take_profit_percent;

        match decision_type {
            DecisionType::Buy => (
                self.config
                    .use_stop_loss
                    .then(|| current_price * (1.0 - sl_pct)),
                self.config
                    .use_take_profit
                    .then(|| current_price * (1.0 + tp_pct)),
            ),
            DecisionType::Short => (
                // Inverted: stop above entry, target below.
                self.config
                    .use_stop_loss
                    .then(|| current_price * (1.0 + sl_pct)),
                self.config
                    .use_take_profit
                    .then(|| current_price * (1.0 - tp_pct)),
            ),
            _ => (None, None),
        }
    }

    // -------------------------------------------------------------------------
    // Streak tracking
    // -------------------------------------------------------------------------

    /// Record a closed trade's PnL for streak-aware sizing and thresholds.
    pub fn record_trade_outcome(&mut self, pnl: f64) {
        if pnl >= 0.0 {
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
        }
        self.trade_history.push(pnl);
        if self.trade_history.len() > MAX_TRADE_HISTORY {
            let excess = self.trade_history.len() - MAX_TRADE_HISTORY;
            self.trade_history.drain(..excess);
        }
        info!(
            pnl,
            wins = self.consecutive_wins,
            losses = self.consecutive_losses,
            "trade outcome recorded"
        );
    }

    pub fn trade_history_len(&self) -> usize {
        self.trade_history.len()
    }

    // -------------------------------------------------------------------------
    // Reasoning & summary
    // -------------------------------------------------------------------------

    fn build_reasoning(
        &self,
        aggregated: &AggregatedSignal,
        threshold: f64,
        _decision_type: DecisionType,
        risk_result: &RiskCheckResult,
        portfolio: &PortfolioState,
    ) -> serde_json::Value {
        json!({
            "weighted_score": aggregated.weighted_score,
            "threshold": threshold,
            "confidence": aggregated.confidence,
            "agreement": aggregated.agreement,
            "signals": {
                "ml": {
                    "score": aggregated.ml_score,
                    "weight": self.config.ml_weight,
                    "details": aggregated.ml_details,
                },
                "rl": {
                    "score": aggregated.rl_score,
                    "weight": self.config.rl_weight,
                    "details": aggregated.rl_details,
                },
                "sentiment": {
                    "score": aggregated.sentiment_score,
                    "weight": self.config.sentiment_weight,
                    "details": aggregated.sentiment_details,
                },
                "technical": {
                    "score": aggregated.technical_score,
                    "weight": self.config.technical_weight,
                    "details": aggregated.technical_details,
                },
            },
            "risk_checks": {
                "passed": risk_result.all_passed,
                "passed_count": risk_result.passed_count,
                "total_count": risk_result.total_count,
                "checks": risk_result.checks,
            },
            "portfolio": {
                "cash": portfolio.cash,
                "total_value": portfolio.total_value,
                "positions_count": portfolio.positions_count,
                "daily_pnl_pct": portfolio.daily_pnl_pct,
            },
        })
    }

    fn create_summary(
        &self,
        symbol: &str,
        decision_type: DecisionType,
        aggregated: &AggregatedSignal,
        risk_result: &RiskCheckResult,
    ) -> String {
        match decision_type {
            DecisionType::Skip => {
                let reason = if aggregated.confidence < self.config.min_confidence {
                    "low confidence"
                } else {
                    "weak agreement"
                };
                format!("{symbol}: Skip - {reason}")
            }
            DecisionType::Buy => {
                if risk_result.all_passed {
                    format!(
                        "{symbol}: BUY - Strong bullish signals ({} agreement, {:.0}% confidence)",
                        aggregated.agreement,
                        aggregated.confidence * 100.0
                    )
                } else {
                    format!("{symbol}: BUY blocked - Risk checks failed")
                }
            }
            DecisionType::Short => {
                if risk_result.all_passed {
                    format!(
                        "{symbol}: SHORT - Strong bearish signals ({} agreement, {:.0}% confidence)",
                        aggregated.agreement,
                        aggregated.confidence * 100.0
                    )
                } else {
                    format!("{symbol}: SHORT blocked - Risk checks failed")
                }
            }
            DecisionType::Sell => format!(
                "{symbol}: SELL - Closing long position due to bearish signals ({} agreement)",
                aggregated.agreement
            ),
            DecisionType::Close => format!("{symbol}: CLOSE position - Weak opposing signal"),
            DecisionType::Hold => format!("{symbol}: HOLD - No strong signal"),
        }
    }
}

/// Minutes since the position's `opened_at`, with the timezone normalised to
/// naive UTC. `None` when the timestamp is absent or unparseable.
pub fn minutes_since_open(opened_at: Option<&str>) -> Option<i64> {
    let raw = opened_at?;
    let naive: NaiveDateTime = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc).naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()?;
    let elapsed = Utc::now().naive_utc() - naive;
    Some(elapsed.num_minutes())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSettings;
    use crate::registry::AgentRegistry;
    use crate::types::PositionSnapshot;

    fn make_engine(config: TraderConfig) -> TraderEngine {
        let backend = Arc::new(BackendClient::new(
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
        ));
        let tmp = std::env::temp_dir().join(format!("meridian-test-{}", uuid::Uuid::new_v4()));
        let mut settings = ServiceSettings::default();
        settings.model_dir = tmp.join("models");
        settings.checkpoint_dir = tmp.join("checkpoints");
        let registry = Arc::new(AgentRegistry::new(
            settings.model_dir.clone(),
            settings.checkpoint_dir.clone(),
        ));
        let trainer = Arc::new(AgentTrainer::new(settings, registry));
        TraderEngine::new(config, backend, trainer)
    }

    fn aggregated(score: f64, confidence: f64, agreement: Agreement) -> AggregatedSignal {
        AggregatedSignal {
            weighted_score: score,
            confidence,
            agreement,
            ml_score: score,
            rl_score: score,
            sentiment_score: score,
            technical_score: score,
            ml_details: json!({}),
            rl_details: json!({}),
            sentiment_details: json!({}),
            technical_details: json!({}),
            market_context: json!({}),
        }
    }

    fn flat_portfolio() -> PortfolioState {
        PortfolioState::default_with_budget(100_000.0)
    }

    fn portfolio_with_position(symbol: &str, side: PositionSide, opened_minutes_ago: i64) -> PortfolioState {
        let mut p = flat_portfolio();
        let opened_at = (Utc::now() - chrono::Duration::minutes(opened_minutes_ago)).to_rfc3339();
        p.positions.insert(
            symbol.to_string(),
            PositionSnapshot {
                quantity: 100.0,
                side,
                entry_price: 100.0,
                current_price: 100.0,
                stop_loss: Some(95.0),
                take_profit: Some(110.0),
                opened_at: Some(opened_at),
                market_value: 10_000.0,
                value: 10_000.0,
            },
        );
        p.positions_count = 1;
        p
    }

    // ---- Scenario: strong bullish agreement ---------------------------------

    #[test]
    fn strong_bullish_agreement_buys_with_fixed_size() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        let agg = aggregated(0.30, 0.78, Agreement::Strong);
        let portfolio = flat_portfolio();

        let threshold = engine.adaptive_threshold(&agg, &portfolio);
        assert!((threshold - 0.65).abs() < 1e-12);

        let decision = engine.determine_decision_type(&agg, threshold, &portfolio, "AAPL");
        assert_eq!(decision, DecisionType::Buy);

        let (size, qty) =
            engine.calculate_position_size(DecisionType::Buy, 150.0, 0.78, &portfolio, None);
        // Fixed 10% of 100k = 10 000 => 66 whole shares at 150.
        assert_eq!(qty, (10_000.0f64 / 150.0).floor());
        assert!((size - qty * 150.0).abs() < 1e-9);
    }

    // ---- Scenario: horizon-aware short --------------------------------------

    #[test]
    fn day_horizon_short_below_trigger() {
        let mut config = TraderConfig::new(1, "t");
        config.allow_short_selling = true;
        let engine = make_engine(config);
        let agg = aggregated(-0.22, 0.80, Agreement::Strong);
        let portfolio = flat_portfolio();

        let decision = engine.determine_decision_type(&agg, 0.65, &portfolio, "TSLA");
        assert_eq!(decision, DecisionType::Short);

        let (_, qty) =
            engine.calculate_position_size(DecisionType::Short, 100.0, 0.80, &portfolio, None);
        assert!(qty < 0.0, "short quantity must be negative");

        let (sl, tp) = engine.calculate_sl_tp(DecisionType::Short, 100.0);
        assert!((sl.unwrap() - 105.0).abs() < 1e-9);
        assert!((tp.unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn short_suppressed_when_disabled() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        let agg = aggregated(-0.30, 0.80, Agreement::Strong);
        let decision = engine.determine_decision_type(&agg, 0.65, &flat_portfolio(), "TSLA");
        assert_eq!(decision, DecisionType::Hold);
    }

    #[test]
    fn short_quota_respects_side_field() {
        let mut config = TraderConfig::new(1, "t");
        config.allow_short_selling = true;
        config.max_short_positions = 1;
        let engine = make_engine(config);

        let mut portfolio = flat_portfolio();
        portfolio.positions.insert(
            "NVDA".to_string(),
            PositionSnapshot {
                quantity: 50.0,
                side: PositionSide::Short,
                market_value: 5_000.0,
                ..Default::default()
            },
        );
        assert!(!engine.can_open_short(&portfolio));

        // Same quantity but long side: quota is free.
        portfolio.positions.get_mut("NVDA").unwrap().side = PositionSide::Long;
        assert!(engine.can_open_short(&portfolio));
    }

    // ---- Boundary: score exactly at buy_strong does not buy -----------------

    #[test]
    fn buy_boundary_is_strict() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        // day horizon: buy_strong = 0.25. Confidence below threshold+0.10
        // keeps the weak-bullish fallback from firing.
        let agg = aggregated(0.25, 0.70, Agreement::Strong);
        let decision = engine.determine_decision_type(&agg, 0.65, &flat_portfolio(), "AAPL");
        assert_eq!(decision, DecisionType::Hold);

        let agg = aggregated(0.2501, 0.70, Agreement::Strong);
        let decision = engine.determine_decision_type(&agg, 0.65, &flat_portfolio(), "AAPL");
        assert_eq!(decision, DecisionType::Buy);
    }

    #[test]
    fn weak_bullish_needs_extra_confidence() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        // Score in (0, buy_strong]: buy only when confidence > threshold+0.10.
        let agg = aggregated(0.10, 0.76, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &flat_portfolio(), "AAPL"),
            DecisionType::Buy
        );
        let agg = aggregated(0.10, 0.74, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &flat_portfolio(), "AAPL"),
            DecisionType::Hold
        );
    }

    // ---- Existing positions -------------------------------------------------

    #[test]
    fn long_position_sell_and_close_thresholds() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        let portfolio = portfolio_with_position("AAPL", PositionSide::Long, 120);

        // day horizon: sell_strong −0.20, sell_weak 0.0.
        let agg = aggregated(-0.25, 0.80, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &portfolio, "AAPL"),
            DecisionType::Sell
        );

        let agg = aggregated(-0.05, 0.80, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &portfolio, "AAPL"),
            DecisionType::Close
        );

        let agg = aggregated(0.10, 0.80, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &portfolio, "AAPL"),
            DecisionType::Hold
        );
    }

    #[test]
    fn short_position_closes_on_rising_score() {
        let mut config = TraderConfig::new(1, "t");
        config.allow_short_selling = true;
        let engine = make_engine(config);
        let portfolio = portfolio_with_position("TSLA", PositionSide::Short, 120);

        let agg = aggregated(0.25, 0.80, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &portfolio, "TSLA"),
            DecisionType::Close
        );

        let agg = aggregated(-0.30, 0.80, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &portfolio, "TSLA"),
            DecisionType::Hold
        );
    }

    #[test]
    fn min_holding_floor_forces_hold() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        // Opened 3 minutes ago; day horizon floor is 30 minutes.
        let portfolio = portfolio_with_position("AAPL", PositionSide::Long, 3);
        let agg = aggregated(-0.50, 0.90, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &portfolio, "AAPL"),
            DecisionType::Hold
        );
    }

    // ---- Skip gates ---------------------------------------------------------

    #[test]
    fn low_confidence_skips() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        let agg = aggregated(0.50, 0.50, Agreement::Strong);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &flat_portfolio(), "AAPL"),
            DecisionType::Skip
        );
    }

    #[test]
    fn weak_agreement_skips_under_confirmation_gate() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        // Default requires moderate agreement.
        let agg = aggregated(0.50, 0.80, Agreement::Weak);
        assert_eq!(
            engine.determine_decision_type(&agg, 0.65, &flat_portfolio(), "AAPL"),
            DecisionType::Skip
        );
    }

    // ---- Adaptive threshold -------------------------------------------------

    #[test]
    fn adaptive_threshold_adjustments() {
        let mut engine = make_engine(TraderConfig::new(1, "t"));
        let portfolio = flat_portfolio();

        let base = engine.adaptive_threshold(&aggregated(0.3, 0.8, Agreement::Strong), &portfolio);
        assert!((base - 0.65).abs() < 1e-12);

        let weak = engine.adaptive_threshold(&aggregated(0.3, 0.8, Agreement::Weak), &portfolio);
        assert!((weak - 0.70).abs() < 1e-12);

        let mixed = engine.adaptive_threshold(&aggregated(0.3, 0.8, Agreement::Mixed), &portfolio);
        assert!((mixed - 0.75).abs() < 1e-12);

        let mut losing = flat_portfolio();
        losing.daily_pnl_pct = -3.0;
        let down_day =
            engine.adaptive_threshold(&aggregated(0.3, 0.8, Agreement::Strong), &losing);
        assert!((down_day - 0.75).abs() < 1e-12);

        for _ in 0..4 {
            engine.record_trade_outcome(-100.0);
        }
        let streak = engine.adaptive_threshold(&aggregated(0.3, 0.8, Agreement::Strong), &portfolio);
        // 0.65 + 0.05 × (4 − 2) = 0.75.
        assert!((streak - 0.75).abs() < 1e-12);
    }

    #[test]
    fn win_streak_raises_threshold_slightly() {
        let mut engine = make_engine(TraderConfig::new(1, "t"));
        let portfolio = flat_portfolio();
        let before =
            engine.adaptive_threshold(&aggregated(0.3, 0.8, Agreement::Strong), &portfolio);
        for _ in 0..6 {
            engine.record_trade_outcome(1_000.0);
        }
        let after =
            engine.adaptive_threshold(&aggregated(0.3, 0.8, Agreement::Strong), &portfolio);
        assert!(after > before);
    }

    #[test]
    fn threshold_capped_at_090() {
        let mut engine = make_engine(TraderConfig::new(1, "t"));
        for _ in 0..20 {
            engine.record_trade_outcome(-100.0);
        }
        let mut losing = flat_portfolio();
        losing.daily_pnl_pct = -5.0;
        let t = engine.adaptive_threshold(&aggregated(0.3, 0.8, Agreement::Mixed), &losing);
        assert!((t - 0.90).abs() < 1e-12);
    }

    // ---- Sizing -------------------------------------------------------------

    #[test]
    fn kelly_sizing_grows_with_confidence() {
        let mut config = TraderConfig::new(1, "t");
        config.position_sizing = PositionSizing::Kelly;
        let engine = make_engine(config);
        let portfolio = flat_portfolio();
        let (low, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.4, &portfolio, None);
        let (high, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.9, &portfolio, None);
        assert!(high > low);
    }

    #[test]
    fn volatility_sizing_inverse_to_atr() {
        let mut config = TraderConfig::new(1, "t");
        config.position_sizing = PositionSizing::Volatility;
        let engine = make_engine(config);
        let portfolio = flat_portfolio();

        let calm_bars: Vec<crate::types::Bar> = (0..30)
            .map(|i| crate::types::Bar {
                timestamp: i,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1e6,
            })
            .collect();
        let wild_bars: Vec<crate::types::Bar> = (0..30)
            .map(|i| crate::types::Bar {
                timestamp: i,
                open: 100.0,
                high: 110.0,
                low: 90.0,
                close: 100.0,
                volume: 1e6,
            })
            .collect();
        let calm = MarketData {
            symbol: "A".into(),
            bars: calm_bars,
            current_price: 100.0,
            volume: 1e6,
        };
        let wild = MarketData {
            symbol: "A".into(),
            bars: wild_bars,
            current_price: 100.0,
            volume: 1e6,
        };

        let (calm_size, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.8, &portfolio, Some(&calm));
        let (wild_size, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.8, &portfolio, Some(&wild));
        assert!(calm_size > wild_size);
    }

    #[test]
    fn volatility_sizing_fallback_uses_confidence() {
        let mut config = TraderConfig::new(1, "t");
        config.position_sizing = PositionSizing::Volatility;
        let engine = make_engine(config);
        let (size, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.7, &flat_portfolio(), None);
        // 100k × 10% × 0.7 = 7 000.
        assert!((size - 7_000.0).abs() < 100.0);
    }

    #[test]
    fn loss_streak_shrinks_size() {
        let mut engine = make_engine(TraderConfig::new(1, "t"));
        let portfolio = flat_portfolio();
        let (before, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.8, &portfolio, None);
        for _ in 0..4 {
            engine.record_trade_outcome(-500.0);
        }
        let (after, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.8, &portfolio, None);
        assert!(after < before);
    }

    #[test]
    fn short_size_carries_07_multiplier() {
        let mut config = TraderConfig::new(1, "t");
        config.allow_short_selling = true;
        let engine = make_engine(config);
        let portfolio = flat_portfolio();
        let (long_size, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.8, &portfolio, None);
        let (short_size, qty) =
            engine.calculate_position_size(DecisionType::Short, 100.0, 0.8, &portfolio, None);
        assert!(qty < 0.0);
        assert!((short_size - long_size * 0.7).abs() < 150.0);
    }

    #[test]
    fn size_respects_cash_buffer_and_cap() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        let mut poor = flat_portfolio();
        poor.cash = 5_000.0;
        let (size, _) =
            engine.calculate_position_size(DecisionType::Buy, 100.0, 0.8, &poor, None);
        assert!(size <= 5_000.0 * 0.95 + 1e-9);
    }

    // ---- SL/TP --------------------------------------------------------------

    #[test]
    fn long_sl_below_tp_above_entry() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        let (sl, tp) = engine.calculate_sl_tp(DecisionType::Buy, 200.0);
        assert!(sl.unwrap() < 200.0);
        assert!(tp.unwrap() > 200.0);
        assert!((sl.unwrap() - 190.0).abs() < 1e-9);
        assert!((tp.unwrap() - 220.0).abs() < 1e-9);
    }

    #[test]
    fn no_sl_tp_for_non_opening_decisions() {
        let engine = make_engine(TraderConfig::new(1, "t"));
        assert_eq!(engine.calculate_sl_tp(DecisionType::Sell, 100.0), (None, None));
        assert_eq!(engine.calculate_sl_tp(DecisionType::Hold, 100.0), (None, None));
    }

    // ---- Streaks ------------------------------------------------------------

    #[test]
    fn streaks_reset_on_opposite_outcome() {
        let mut engine = make_engine(TraderConfig::new(1, "t"));
        engine.record_trade_outcome(-100.0);
        engine.record_trade_outcome(-200.0);
        assert_eq!(engine.consecutive_losses, 2);
        engine.record_trade_outcome(100.0);
        assert_eq!(engine.consecutive_losses, 0);
        assert_eq!(engine.consecutive_wins, 1);
    }

    #[test]
    fn trade_history_capped_at_100() {
        let mut engine = make_engine(TraderConfig::new(1, "t"));
        for i in 0..150 {
            engine.record_trade_outcome(if i % 2 == 0 { 100.0 } else { -50.0 });
        }
        assert!(engine.trade_history_len() <= 100);
    }

    // ---- Synthetic SL/TP close ----------------------------------------------

    #[test]
    fn synthetic_close_bypasses_risk() {
        let decision = TradingDecision::sl_tp_close(
            "AAPL",
            PositionSide::Long,
            100.0,
            94.0,
            Some(95.0),
            Some(110.0),
            "stop_loss",
        );
        assert_eq!(decision.decision_type, DecisionType::Close);
        assert!((decision.confidence - 1.0).abs() < f64::EPSILON);
        assert!(decision.risk_checks_passed);
        assert!(decision.risk_blockers.is_empty());
        assert_eq!(decision.quantity, Some(100.0));
        assert_eq!(decision.reasoning["trigger"], "stop_loss");
        assert_eq!(decision.reasoning["trigger_price"], 95.0);
    }

    // ---- opened_at parsing --------------------------------------------------

    #[test]
    fn minutes_since_open_parses_rfc3339_and_naive() {
        let recent = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
        let m = minutes_since_open(Some(&recent)).unwrap();
        assert!((9..=11).contains(&m));

        let naive = (Utc::now() - chrono::Duration::minutes(45))
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S%.f")
            .to_string();
        let m = minutes_since_open(Some(&naive)).unwrap();
        assert!((44..=46).contains(&m));

        assert!(minutes_since_open(None).is_none());
        assert!(minutes_since_open(Some("not a date")).is_none());
    }
}
