// =============================================================================
// Trader Scheduler — concurrent per-trader control loops
// =============================================================================
//
// Each started trader runs an isolated cooperative task with its own HTTP
// client and engine. One loop iteration:
//   1. Outside the trading window: maybe self-train, sleep 60 s.
//   2. Fetch the portfolio snapshot.
//   3. SL/TP sweep over open positions (bypasses risk checks and
//      min-holding; sets cooldowns).
//   4. Evaluate every watchlist symbol not swept and not on cooldown.
//   5. Sleep the check interval.
//
// Cancellation is cooperative via a CancellationToken checked at sleep
// boundaries. Double-start is a no-op; stop cancels and joins the task.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent_config::TraderConfig;
use crate::backend::BackendClient;
use crate::config::ServiceSettings;
use crate::engine::{TraderEngine, TradingDecision};
use crate::indicators::prepare_for_training;
use crate::risk::is_trading_time;
use crate::trainer::{AgentTrainer, ProgressFn};
use crate::types::{PortfolioState, PositionSide};

/// Minimum points per symbol for self-training data.
const SELF_TRAINING_MIN_POINTS: usize = 200;
/// Symbols to collect before self-training starts.
const SELF_TRAINING_TARGET_SYMBOLS: usize = 3;
/// Attempt budget over the shuffled watchlist.
const SELF_TRAINING_MAX_ATTEMPTS: usize = 10;

/// Published state of a trader's self-training task.
#[derive(Debug, Clone, Serialize)]
pub struct SelfTrainingStatus {
    pub is_training: bool,
    /// One of: starting, training, complete, failed.
    pub status: String,
    pub agent_name: String,
    pub progress: f64,
    pub timesteps: usize,
    pub total_timesteps: usize,
    pub current_reward: Option<f64>,
    pub message: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub symbols: Vec<String>,
}

impl SelfTrainingStatus {
    fn starting(agent_name: &str, total_timesteps: usize) -> Self {
        Self {
            is_training: true,
            status: "starting".to_string(),
            agent_name: agent_name.to_string(),
            progress: 0.0,
            timesteps: 0,
            total_timesteps,
            current_reward: None,
            message: "Preparing training data...".to_string(),
            started_at: Some(Utc::now().to_rfc3339()),
            completed_at: None,
            symbols: Vec::new(),
        }
    }
}

struct TraderHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    name: String,
}

/// Process-wide scheduler: the trader table, self-training state and the
/// per-(trader, symbol) cooldown table.
pub struct TraderScheduler {
    settings: ServiceSettings,
    trainer: Arc<AgentTrainer>,
    traders: tokio::sync::Mutex<HashMap<i64, TraderHandle>>,
    training_tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
    last_training_time: Mutex<HashMap<i64, DateTime<Utc>>>,
    self_training_status: RwLock<HashMap<i64, SelfTrainingStatus>>,
    cooldowns: Mutex<HashMap<(i64, String), DateTime<Utc>>>,
}

impl TraderScheduler {
    pub fn new(settings: ServiceSettings, trainer: Arc<AgentTrainer>) -> Self {
        Self {
            settings,
            trainer,
            traders: tokio::sync::Mutex::new(HashMap::new()),
            training_tasks: Mutex::new(HashMap::new()),
            last_training_time: Mutex::new(HashMap::new()),
            self_training_status: RwLock::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn a trader loop. Starting an already-running trader is a no-op
    /// that preserves the existing task; returns whether a new loop started.
    pub async fn start_trader(self: &Arc<Self>, config: TraderConfig) -> bool {
        let trader_id = config.trader_id;
        let mut traders = self.traders.lock().await;
        if traders.contains_key(&trader_id) {
            info!(trader_id, "trader already running, start is a no-op");
            return false;
        }

        let weight_sum = config.weight_sum();
        info!(
            trader_id,
            name = %config.name,
            symbols = config.symbols.len(),
            signal_weight_sum = weight_sum,
            "starting trader"
        );

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let loop_cancel = cancel.clone();
        let name = config.name.clone();
        let task = tokio::spawn(async move {
            scheduler.run_trader_loop(config, loop_cancel).await;
        });

        traders.insert(
            trader_id,
            TraderHandle {
                cancel,
                task,
                name,
            },
        );
        true
    }

    /// Cancel a trader loop and wait for it to drain. Returns whether a
    /// loop was actually stopped.
    pub async fn stop_trader(&self, trader_id: i64) -> bool {
        let handle = {
            let mut traders = self.traders.lock().await;
            traders.remove(&trader_id)
        };
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                if let Err(e) = handle.task.await {
                    warn!(trader_id, error = %e, "trader task join failed");
                }
                info!(trader_id, name = %handle.name, "trader stopped");
                true
            }
            None => {
                info!(trader_id, "trader is not running");
                false
            }
        }
    }

    pub async fn running_traders(&self) -> Vec<i64> {
        self.traders.lock().await.keys().copied().collect()
    }

    pub async fn is_running(&self, trader_id: i64) -> bool {
        self.traders.lock().await.contains_key(&trader_id)
    }

    /// Stop every trader (shutdown path).
    pub async fn shutdown(&self) {
        let ids: Vec<i64> = self.traders.lock().await.keys().copied().collect();
        futures_util::future::join_all(ids.into_iter().map(|id| self.stop_trader(id))).await;
    }

    pub fn self_training_status(&self, trader_id: i64) -> Option<SelfTrainingStatus> {
        self.self_training_status.read().get(&trader_id).cloned()
    }

    // -------------------------------------------------------------------------
    // Resume on boot
    // -------------------------------------------------------------------------

    /// Query the backend for traders with status `running` and restart their
    /// loops from the stored personality tree.
    pub async fn resume_running_traders(self: &Arc<Self>) {
        let backend = BackendClient::new(
            self.settings.backend_url.clone(),
            self.settings.ml_service_url.clone(),
        );
        let traders = match backend.fetch_traders().await {
            Ok(traders) => traders,
            Err(e) => {
                warn!(error = %e, "could not fetch traders for resume");
                return;
            }
        };

        let running: Vec<&serde_json::Value> = traders
            .iter()
            .filter(|t| t.get("status").and_then(|s| s.as_str()) == Some("running"))
            .collect();
        if running.is_empty() {
            info!("no running traders to resume");
            return;
        }
        info!(count = running.len(), "resuming running traders");

        for trader in running {
            let trader_id = match trader.get("id").and_then(|v| v.as_i64()) {
                Some(id) => id,
                None => continue,
            };
            let name = trader
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Trader-{trader_id}"));
            let personality = trader
                .get("personality")
                .cloned()
                .unwrap_or_else(|| json!({}));

            let config = TraderConfig::from_personality(trader_id, name.clone(), &personality);
            if self.start_trader(config).await {
                info!(trader_id, name = %name, "resumed trader");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trader loop
    // -------------------------------------------------------------------------

    async fn run_trader_loop(self: Arc<Self>, config: TraderConfig, cancel: CancellationToken) {
        let trader_id = config.trader_id;
        info!(trader_id, "trader loop started");

        let backend = Arc::new(BackendClient::new(
            self.settings.backend_url.clone(),
            self.settings.ml_service_url.clone(),
        ));
        let mut engine = TraderEngine::new(config.clone(), backend.clone(), self.trainer.clone());

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Off-hours: self-training opportunity, then a short sleep.
            if !is_trading_time(&config) {
                if config.self_training_enabled {
                    self.maybe_self_train(&config).await;
                }
                if sleep_or_cancel(&cancel, 60).await {
                    break;
                }
                continue;
            }

            if let Err(e) = self
                .run_tick(trader_id, &config, &backend, &mut engine, &cancel)
                .await
            {
                // A single failed tick never kills the loop.
                error!(trader_id, error = %e, "trader tick failed");
            }

            if sleep_or_cancel(&cancel, config.check_interval_seconds).await {
                break;
            }
        }

        info!(trader_id, "trader loop exited");
    }

    /// One full tick: portfolio, SL/TP sweep, per-symbol decisions.
    async fn run_tick(
        &self,
        trader_id: i64,
        config: &TraderConfig,
        backend: &Arc<BackendClient>,
        engine: &mut TraderEngine,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let portfolio = match backend.fetch_portfolio(trader_id).await {
            Ok(p) => p,
            Err(e) => {
                debug!(trader_id, error = %e, "portfolio unavailable, using defaults");
                PortfolioState::default_with_budget(config.initial_budget)
            }
        };

        // SL/TP sweep first; swept symbols are closed for this tick.
        let closed = self
            .check_sl_tp_exits(trader_id, config, backend, engine, &portfolio)
            .await;

        for symbol in &config.symbols {
            if cancel.is_cancelled() {
                break;
            }
            if closed.contains(symbol) {
                debug!(trader_id, symbol = %symbol, "skipping, just closed via SL/TP");
                continue;
            }
            if self.is_on_cooldown(trader_id, symbol, config.cooldown_minutes) {
                continue;
            }

            let market = match backend.fetch_market_data(symbol).await {
                Ok(Some(market)) => market,
                Ok(None) => {
                    debug!(trader_id, symbol = %symbol, "no market data, skipping");
                    continue;
                }
                Err(e) => {
                    debug!(trader_id, symbol = %symbol, error = %e, "market data unavailable");
                    continue;
                }
            };

            let decision = engine.analyze_symbol(symbol, &market, &portfolio).await;
            let _ = backend
                .post_decision(trader_id, &decision_payload(&decision))
                .await;

            if decision.decision_type.is_executable() && decision.risk_checks_passed {
                let executed = self
                    .execute_decision(trader_id, backend, &decision)
                    .await;
                if executed {
                    use crate::types::DecisionType::*;
                    if matches!(decision.decision_type, Sell | Close) {
                        self.set_cooldown(trader_id, symbol);
                        if let Some(pnl) = position_pnl(&portfolio, symbol) {
                            engine.record_trade_outcome(pnl);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // SL/TP sweep
    // -------------------------------------------------------------------------

    /// Check every open position against its SL/TP by side. Hits synthesise
    /// a `close` decision with confidence 1.0 that bypasses risk checks and
    /// min-holding floors.
    async fn check_sl_tp_exits(
        &self,
        trader_id: i64,
        _config: &TraderConfig,
        backend: &Arc<BackendClient>,
        engine: &mut TraderEngine,
        portfolio: &PortfolioState,
    ) -> HashSet<String> {
        let mut closed = HashSet::new();

        for (symbol, position) in &portfolio.positions {
            let price = position.current_price;
            if price <= 0.0 || position.quantity == 0.0 {
                continue;
            }

            let trigger = sl_tp_trigger(
                position.side,
                price,
                position.stop_loss,
                position.take_profit,
            );
            let trigger = match trigger {
                Some(t) => t,
                None => continue,
            };

            info!(
                trader_id,
                symbol = %symbol,
                side = %position.side,
                price,
                trigger,
                "position hit {}",
                trigger
            );

            let decision = TradingDecision::sl_tp_close(
                symbol,
                position.side,
                position.quantity,
                price,
                position.stop_loss,
                position.take_profit,
                trigger,
            );
            let _ = backend
                .post_decision(trader_id, &decision_payload(&decision))
                .await;

            if self.execute_decision(trader_id, backend, &decision).await {
                closed.insert(symbol.clone());
                self.set_cooldown(trader_id, symbol);
                if let Some(pnl) = position_pnl(portfolio, symbol) {
                    engine.record_trade_outcome(pnl);
                }
            }
        }

        closed
    }

    /// Execute a decision and mark it executed. Execution failure logs and
    /// continues; the decision stays unmarked.
    async fn execute_decision(
        &self,
        trader_id: i64,
        backend: &Arc<BackendClient>,
        decision: &TradingDecision,
    ) -> bool {
        let request = crate::backend::ExecuteRequest {
            symbol: decision.symbol.clone(),
            action: decision.decision_type.to_string(),
            quantity: decision.quantity.unwrap_or(0.0),
            price: decision.price.unwrap_or(0.0),
            stop_loss: decision.stop_loss,
            take_profit: decision.take_profit,
            reasoning: decision.summary_short.clone(),
        };
        match backend.execute_trade(trader_id, &request).await {
            Ok(true) => {
                let _ = backend
                    .mark_decision_executed(
                        trader_id,
                        &decision.symbol,
                        &decision.decision_type.to_string(),
                        &decision.timestamp.to_rfc3339(),
                    )
                    .await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(trader_id, symbol = %decision.symbol, error = %e, "trade execution failed");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cooldowns
    // -------------------------------------------------------------------------

    /// True while `now − last_close < cooldown_minutes`; expired entries are
    /// removed on consultation.
    pub fn is_on_cooldown(&self, trader_id: i64, symbol: &str, cooldown_minutes: i64) -> bool {
        let key = (trader_id, symbol.to_string());
        let mut cooldowns = self.cooldowns.lock();
        match cooldowns.get(&key) {
            Some(last_close) => {
                let elapsed = (Utc::now() - *last_close).num_minutes();
                if elapsed < cooldown_minutes {
                    true
                } else {
                    cooldowns.remove(&key);
                    false
                }
            }
            None => false,
        }
    }

    pub fn set_cooldown(&self, trader_id: i64, symbol: &str) {
        self.cooldowns
            .lock()
            .insert((trader_id, symbol.to_string()), Utc::now());
        debug!(trader_id, symbol, "cooldown set after close");
    }

    #[cfg(test)]
    fn backdate_cooldown(&self, trader_id: i64, symbol: &str, minutes_ago: i64) {
        self.cooldowns.lock().insert(
            (trader_id, symbol.to_string()),
            Utc::now() - chrono::Duration::minutes(minutes_ago),
        );
    }

    // -------------------------------------------------------------------------
    // Self-training
    // -------------------------------------------------------------------------

    /// Fire a self-training task when the interval elapsed and none is
    /// running for this trader.
    async fn maybe_self_train(self: &Arc<Self>, config: &TraderConfig) {
        let trader_id = config.trader_id;

        {
            let last = self.last_training_time.lock();
            if let Some(last_time) = last.get(&trader_id) {
                let elapsed = (Utc::now() - *last_time).num_minutes();
                if elapsed < config.self_training_interval_minutes {
                    return;
                }
            }
        }
        {
            let mut tasks = self.training_tasks.lock();
            if let Some(task) = tasks.get(&trader_id) {
                if !task.is_finished() {
                    return;
                }
                tasks.remove(&trader_id);
            }
        }

        let agent_name = config
            .rl_agent_name
            .clone()
            .unwrap_or_else(|| format!("trader_{trader_id}_agent"));
        if self.trainer.is_training(&agent_name) {
            return;
        }

        info!(trader_id, agent = %agent_name, "starting self-training (idle period)");
        self.last_training_time.lock().insert(trader_id, Utc::now());
        self.self_training_status.write().insert(
            trader_id,
            SelfTrainingStatus::starting(&agent_name, config.self_training_timesteps),
        );

        let scheduler = self.clone();
        let config = config.clone();
        let task = tokio::spawn(async move {
            scheduler.run_self_training(config, agent_name).await;
        });
        self.training_tasks.lock().insert(trader_id, task);
    }

    async fn run_self_training(self: Arc<Self>, config: TraderConfig, agent_name: String) {
        let trader_id = config.trader_id;
        let backend = BackendClient::new(
            self.settings.backend_url.clone(),
            self.settings.ml_service_url.clone(),
        );

        let update_status = |f: &dyn Fn(&mut SelfTrainingStatus)| {
            if let Some(status) = self.self_training_status.write().get_mut(&trader_id) {
                f(status);
            }
        };

        // --- Collect training data over a shuffled watchlist ------------------
        update_status(&|s| {
            s.message = "Searching for training data...".to_string();
            s.progress = 10.0;
        });

        let mut symbols = config.symbols.clone();
        symbols.shuffle(&mut rand::thread_rng());
        let attempts = symbols.len().min(SELF_TRAINING_MAX_ATTEMPTS);

        let mut training_data = HashMap::new();
        for symbol in symbols.iter().take(attempts) {
            if training_data.len() >= SELF_TRAINING_TARGET_SYMBOLS {
                break;
            }
            for period in ["5y", "2y", "1y"] {
                match backend.fetch_chart(symbol, period).await {
                    Ok(bars) if bars.len() >= SELF_TRAINING_MIN_POINTS => {
                        match prepare_for_training(&bars) {
                            Ok(frame) if frame.len() >= SELF_TRAINING_MIN_POINTS => {
                                info!(
                                    trader_id,
                                    symbol = %symbol,
                                    rows = frame.len(),
                                    period,
                                    "loaded self-training data"
                                );
                                training_data.insert(symbol.clone(), frame);
                                let loaded = training_data.keys().cloned().collect::<Vec<_>>();
                                update_status(&move |s| {
                                    s.progress = 10.0
                                        + loaded.len() as f64
                                            / SELF_TRAINING_TARGET_SYMBOLS as f64
                                            * 10.0;
                                    s.symbols = loaded.clone();
                                });
                                break;
                            }
                            _ => continue,
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(trader_id, symbol = %symbol, period, error = %e, "chart fetch failed");
                        continue;
                    }
                }
            }
        }

        if training_data.is_empty() {
            warn!(trader_id, "no training data available for self-training");
            update_status(&|s| {
                s.is_training = false;
                s.status = "failed".to_string();
                s.message = "No training data available".to_string();
            });
            return;
        }

        let loaded_symbols: Vec<String> = training_data.keys().cloned().collect();

        // --- Train with continue semantics ------------------------------------
        let agent_config = config.self_training_agent_config(&agent_name);
        update_status(&|s| {
            s.status = "training".to_string();
            s.progress = 20.0;
        });
        {
            let n = training_data.len();
            update_status(&move |s| s.message = format!("Training on {n} symbols..."));
        }

        let status_map = self.clone();
        let progress: ProgressFn = Arc::new(move |update| {
            if let Some(status) = status_map.self_training_status.write().get_mut(&trader_id) {
                // Map 0..1 session progress into the 20–95% band.
                status.progress = (20.0 + update.progress * 75.0).min(95.0);
                status.timesteps = update.timesteps;
                status.total_timesteps = update.total_timesteps;
                status.current_reward = update.mean_reward;
                status.message = format!(
                    "Training... {}/{} steps",
                    update.timesteps, update.total_timesteps
                );
            }
        });

        let started_at = self
            .self_training_status
            .read()
            .get(&trader_id)
            .and_then(|s| s.started_at.clone())
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        let result = self
            .trainer
            .train_agent(
                &agent_name,
                agent_config,
                training_data,
                config.self_training_timesteps,
                true,
                Some(progress),
            )
            .await;

        match result {
            Ok(metadata) => {
                let mean_return = metadata
                    .performance_metrics
                    .as_ref()
                    .and_then(|m| m.mean_return_pct)
                    .unwrap_or(0.0);
                info!(
                    trader_id,
                    agent = %agent_name,
                    mean_return_pct = mean_return,
                    cumulative_timesteps = metadata.cumulative_timesteps,
                    sessions = metadata.training_sessions,
                    "self-training complete"
                );

                {
                    let symbols = loaded_symbols.clone();
                    let cumulative = metadata.cumulative_timesteps;
                    update_status(&move |s| {
                        s.is_training = false;
                        s.status = "complete".to_string();
                        s.progress = 100.0;
                        s.completed_at = Some(Utc::now().to_rfc3339());
                        s.symbols = symbols.clone();
                        s.message = format!(
                            "Training complete! Return: {mean_return:.2}% (Total: {cumulative} steps)"
                        );
                    });
                }

                // Persist the history record; notification errors are
                // swallowed.
                let record = json!({
                    "agent_name": agent_name,
                    "training_type": if metadata.continued_from_previous { "continue_training" } else { "self_training" },
                    "status": "completed",
                    "started_at": started_at,
                    "completed_at": Utc::now().to_rfc3339(),
                    "duration_seconds": metadata.training_duration_seconds,
                    "total_timesteps": metadata.total_timesteps,
                    "cumulative_timesteps": metadata.cumulative_timesteps,
                    "training_sessions": metadata.training_sessions,
                    "continued_from_previous": metadata.continued_from_previous,
                    "best_reward": metadata.best_reward,
                    "mean_return_pct": mean_return,
                    "episodes_completed": metadata.total_episodes,
                    "cumulative_episodes": metadata.cumulative_episodes,
                    "symbols_trained": loaded_symbols,
                    "metadata": {
                        "performance_metrics": metadata.performance_metrics,
                        "oos_performance_metrics": metadata.oos_performance_metrics,
                    },
                });
                if let Err(e) = backend.post_training_history(trader_id, &record).await {
                    warn!(trader_id, error = %e, "failed to persist training history");
                }
                let _ = backend
                    .post_event(
                        trader_id,
                        "self_training_complete",
                        &format!("Self-training complete. Return: {mean_return:.2}%"),
                        json!({
                            "agent_name": record["agent_name"],
                            "cumulative_timesteps": metadata.cumulative_timesteps,
                            "training_sessions": metadata.training_sessions,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                warn!(trader_id, error = %e, "self-training failed");
                let message = e.to_string();
                update_status(&move |s| {
                    s.is_training = false;
                    s.status = "failed".to_string();
                    s.message = message.clone();
                });
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Sleep that returns true when cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, seconds: u64) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(std::time::Duration::from_secs(seconds)) => false,
    }
}

/// Which trigger, if any, the current price tripped, honouring the side.
fn sl_tp_trigger(
    side: PositionSide,
    current_price: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> Option<&'static str> {
    if let Some(sl) = stop_loss {
        match side {
            PositionSide::Long if current_price <= sl => return Some("stop_loss"),
            PositionSide::Short if current_price >= sl => return Some("stop_loss"),
            _ => {}
        }
    }
    if let Some(tp) = take_profit {
        match side {
            PositionSide::Long if current_price >= tp => return Some("take_profit"),
            PositionSide::Short if current_price <= tp => return Some("take_profit"),
            _ => {}
        }
    }
    None
}

/// Unrealised PnL of a position snapshot, signed by side.
fn position_pnl(portfolio: &PortfolioState, symbol: &str) -> Option<f64> {
    let p = portfolio.positions.get(symbol)?;
    if p.entry_price <= 0.0 || p.current_price <= 0.0 {
        return None;
    }
    let per_share = match p.side {
        PositionSide::Long => p.current_price - p.entry_price,
        PositionSide::Short => p.entry_price - p.current_price,
    };
    Some(per_share * p.quantity.abs())
}

/// Decision payload posted to the backend's decisions endpoint.
fn decision_payload(decision: &TradingDecision) -> serde_json::Value {
    json!({
        "symbol": decision.symbol,
        "decision_type": decision.decision_type,
        "confidence": decision.confidence,
        "weighted_score": decision.weighted_score,
        "ml_score": decision.ml_score,
        "rl_score": decision.rl_score,
        "sentiment_score": decision.sentiment_score,
        "technical_score": decision.technical_score,
        "signal_agreement": decision.signal_agreement,
        "reasoning": decision.reasoning,
        "summary": decision.summary_short,
        "quantity": decision.quantity,
        "price": decision.price,
        "stop_loss": decision.stop_loss,
        "take_profit": decision.take_profit,
        "risk_checks_passed": decision.risk_checks_passed,
        "risk_warnings": decision.risk_warnings,
        "risk_blockers": decision.risk_blockers,
        "timestamp": decision.timestamp.to_rfc3339(),
    })
}
