// =============================================================================
// Risk Manager — layered pre-trade checks with graduated position scaling
// =============================================================================
//
// A fixed ordered list of checks runs before every trade. Each check reports
// pass/fail, the observed value against its limit, and a severity; a single
// failed blocker fails the batch. The graduated drawdown check never blocks
// — it returns a position scale factor the engine applies to the size.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, warn};

use crate::agent_config::TraderConfig;
use crate::backend::BackendClient;
use crate::types::{DecisionType, PortfolioState};

/// Severity class of one risk check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocker,
    Warning,
    Info,
}

/// Result of a single risk check.
#[derive(Debug, Clone, Serialize)]
pub struct RiskCheck {
    pub name: &'static str,
    pub category: &'static str,
    pub passed: bool,
    pub value: String,
    pub limit: String,
    pub description: String,
    pub severity: Severity,
}

/// Aggregated result of the whole check batch.
#[derive(Debug, Clone, Serialize)]
pub struct RiskCheckResult {
    pub all_passed: bool,
    pub passed_count: usize,
    pub total_count: usize,
    pub checks: Vec<RiskCheck>,
    pub warnings: Vec<String>,
    pub blockers: Vec<String>,
    /// Multiplicative shrinkage from the graduated drawdown check;
    /// 1.0 = full size.
    pub position_scale_factor: f64,
}

/// Runs the ordered check list for one trader.
pub struct RiskManager {
    config: TraderConfig,
    backend: Arc<BackendClient>,
}

impl RiskManager {
    pub fn new(config: TraderConfig, backend: Arc<BackendClient>) -> Self {
        Self { config, backend }
    }

    /// Run every check in order. `consecutive_losses` comes from the
    /// engine's streak tracker.
    pub async fn check_all(
        &self,
        symbol: &str,
        decision_type: DecisionType,
        position_size: f64,
        portfolio: &PortfolioState,
        consecutive_losses: u32,
    ) -> RiskCheckResult {
        let mut checks = Vec::with_capacity(11);

        checks.push(self.check_position_size(position_size));
        checks.push(self.check_max_positions(portfolio, decision_type));
        checks.push(self.check_symbol_exposure(symbol, position_size, portfolio));
        checks.push(self.check_total_exposure(position_size, portfolio, decision_type));
        checks.push(self.check_cash_reserve(position_size, portfolio));
        checks.push(self.check_daily_loss(portfolio));
        checks.push(self.check_max_drawdown(portfolio));
        checks.push(self.check_trading_hours());
        checks.push(self.check_loss_cooldown(consecutive_losses));
        checks.push(self.check_vix().await);

        let (dd_check, position_scale_factor) = self.check_drawdown_graduated(portfolio);
        checks.push(dd_check);

        let mut blockers = Vec::new();
        let mut warnings = Vec::new();
        let mut passed_count = 0;
        for check in &checks {
            if check.passed {
                passed_count += 1;
            } else {
                match check.severity {
                    Severity::Blocker => {
                        blockers.push(format!("{}: {}", check.name, check.description))
                    }
                    Severity::Warning => {
                        warnings.push(format!("{}: {}", check.name, check.description))
                    }
                    Severity::Info => {}
                }
            }
        }

        let all_passed = blockers.is_empty();
        debug!(
            symbol,
            decision = %decision_type,
            passed_count,
            total = checks.len(),
            all_passed,
            position_scale_factor,
            "risk checks complete"
        );

        RiskCheckResult {
            all_passed,
            passed_count,
            total_count: checks.len(),
            checks,
            warnings,
            blockers,
            position_scale_factor,
        }
    }

    // -------------------------------------------------------------------------
    // 1. Position size
    // -------------------------------------------------------------------------

    fn check_position_size(&self, position_size: f64) -> RiskCheck {
        let max_position = self.config.initial_budget * self.config.max_position_size;
        let passed = position_size <= max_position;
        RiskCheck {
            name: "Position Size",
            category: "position",
            passed,
            value: format!("${position_size:.0}"),
            limit: format!("${max_position:.0}"),
            description: format!(
                "Position size must not exceed {:.0}% of budget",
                self.config.max_position_size * 100.0
            ),
            severity: if passed { Severity::Info } else { Severity::Blocker },
        }
    }

    // -------------------------------------------------------------------------
    // 2. Max positions — only enforced when opening
    // -------------------------------------------------------------------------

    fn check_max_positions(
        &self,
        portfolio: &PortfolioState,
        decision_type: DecisionType,
    ) -> RiskCheck {
        let current = portfolio.positions_count;
        let passed = if decision_type.opens_position() {
            current < self.config.max_positions
        } else {
            true
        };
        RiskCheck {
            name: "Max Positions",
            category: "position",
            passed,
            value: current.to_string(),
            limit: self.config.max_positions.to_string(),
            description: format!("Cannot exceed {} open positions", self.config.max_positions),
            severity: if passed { Severity::Info } else { Severity::Blocker },
        }
    }

    // -------------------------------------------------------------------------
    // 3. Symbol exposure
    // -------------------------------------------------------------------------

    fn check_symbol_exposure(
        &self,
        symbol: &str,
        new_position_size: f64,
        portfolio: &PortfolioState,
    ) -> RiskCheck {
        let current_exposure = portfolio
            .positions
            .get(symbol)
            .map(|p| p.value)
            .unwrap_or(0.0);
        let total = current_exposure + new_position_size;
        let cap = self.config.initial_budget * self.config.max_position_size;
        let passed = total <= cap;
        RiskCheck {
            name: "Symbol Exposure",
            category: "exposure",
            passed,
            value: format!("${total:.0}"),
            limit: format!("${cap:.0}"),
            description: format!(
                "Total exposure to {symbol} must not exceed {:.0}% of budget",
                self.config.max_position_size * 100.0
            ),
            severity: if passed { Severity::Info } else { Severity::Blocker },
        }
    }

    // -------------------------------------------------------------------------
    // 4. Total exposure
    // -------------------------------------------------------------------------

    fn check_total_exposure(
        &self,
        new_position_size: f64,
        portfolio: &PortfolioState,
        decision_type: DecisionType,
    ) -> RiskCheck {
        let mut total_invested = portfolio.total_invested;
        if decision_type.opens_position() {
            total_invested += new_position_size;
        }
        let cap = self.config.initial_budget * self.config.max_total_exposure;
        let passed = total_invested <= cap;
        RiskCheck {
            name: "Total Exposure",
            category: "exposure",
            passed,
            value: format!("${total_invested:.0}"),
            limit: format!("${cap:.0}"),
            description: format!(
                "Total exposure must not exceed {:.0}% of budget",
                self.config.max_total_exposure * 100.0
            ),
            severity: if passed { Severity::Info } else { Severity::Blocker },
        }
    }

    // -------------------------------------------------------------------------
    // 5. Cash reserve
    // -------------------------------------------------------------------------

    fn check_cash_reserve(&self, position_size: f64, portfolio: &PortfolioState) -> RiskCheck {
        let min_reserve = self.config.initial_budget * self.config.reserve_cash;
        let remaining = portfolio.cash - position_size;
        let passed = remaining >= min_reserve;
        RiskCheck {
            name: "Cash Reserve",
            category: "liquidity",
            passed,
            value: format!("${remaining:.0}"),
            limit: format!("${min_reserve:.0}"),
            description: format!(
                "Must maintain {:.0}% cash reserve",
                self.config.reserve_cash * 100.0
            ),
            severity: if passed { Severity::Info } else { Severity::Blocker },
        }
    }

    // -------------------------------------------------------------------------
    // 6. Daily loss
    // -------------------------------------------------------------------------

    fn check_daily_loss(&self, portfolio: &PortfolioState) -> RiskCheck {
        let max_loss_pct = self.config.max_daily_loss * 100.0;
        let passed = portfolio.daily_pnl_pct > -max_loss_pct;
        RiskCheck {
            name: "Daily Loss",
            category: "loss_limit",
            passed,
            value: format!("{:.2}%", portfolio.daily_pnl_pct),
            limit: format!("-{max_loss_pct:.1}%"),
            description: format!("Daily loss must not exceed {max_loss_pct:.1}%"),
            severity: if passed { Severity::Warning } else { Severity::Blocker },
        }
    }

    // -------------------------------------------------------------------------
    // 7. Max drawdown
    // -------------------------------------------------------------------------

    fn check_max_drawdown(&self, portfolio: &PortfolioState) -> RiskCheck {
        let drawdown = drawdown_of(portfolio, self.config.initial_budget);
        let passed = drawdown < self.config.max_drawdown;
        RiskCheck {
            name: "Max Drawdown",
            category: "loss_limit",
            passed,
            value: format!("{:.2}%", drawdown * 100.0),
            limit: format!("{:.1}%", self.config.max_drawdown * 100.0),
            description: format!(
                "Drawdown must not exceed {:.1}%",
                self.config.max_drawdown * 100.0
            ),
            severity: if passed { Severity::Warning } else { Severity::Blocker },
        }
    }

    // -------------------------------------------------------------------------
    // 8. Trading hours
    // -------------------------------------------------------------------------

    fn check_trading_hours(&self) -> RiskCheck {
        if !self.config.schedule_enabled {
            return RiskCheck {
                name: "Trading Hours",
                category: "schedule",
                passed: true,
                value: "Disabled".to_string(),
                limit: "N/A".to_string(),
                description: "Schedule checks disabled".to_string(),
                severity: Severity::Info,
            };
        }

        match trading_window_now(&self.config) {
            Ok(window) => RiskCheck {
                name: "Trading Hours",
                category: "schedule",
                passed: window.within,
                value: window.current,
                limit: window.limit,
                description: "Must trade within allowed hours (with buffers)".to_string(),
                severity: if window.within { Severity::Info } else { Severity::Blocker },
            },
            Err(e) => {
                warn!(error = %e, "trading hours check failed");
                RiskCheck {
                    name: "Trading Hours",
                    category: "schedule",
                    passed: false,
                    value: "Error".to_string(),
                    limit: "N/A".to_string(),
                    description: format!("Error checking trading hours: {e}"),
                    severity: Severity::Warning,
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // 9. Consecutive-loss cooldown
    // -------------------------------------------------------------------------

    fn check_loss_cooldown(&self, consecutive_losses: u32) -> RiskCheck {
        let limit = self.config.max_consecutive_losses;
        let passed = consecutive_losses < limit;
        RiskCheck {
            name: "Loss Cooldown",
            category: "protection",
            passed,
            value: consecutive_losses.to_string(),
            limit: limit.to_string(),
            description: if passed {
                format!("{consecutive_losses}/{limit} consecutive losses")
            } else {
                format!("Cooldown active after {consecutive_losses} consecutive losses")
            },
            severity: if passed { Severity::Info } else { Severity::Blocker },
        }
    }

    // -------------------------------------------------------------------------
    // 10. VIX gate — elevated volatility warns, never blocks
    // -------------------------------------------------------------------------

    async fn check_vix(&self) -> RiskCheck {
        let limit = self.config.pause_on_high_vix;
        match self.backend.fetch_vix().await {
            Ok(level) => {
                let passed = level < limit;
                RiskCheck {
                    name: "VIX Level",
                    category: "market",
                    passed,
                    value: format!("{level:.2}"),
                    limit: format!("<{limit:.0}"),
                    description: "High VIX indicates elevated market volatility".to_string(),
                    severity: if passed { Severity::Info } else { Severity::Warning },
                }
            }
            Err(e) => {
                // Data unavailable: degrade to an informational pass.
                debug!(error = %e, "VIX fetch failed");
                RiskCheck {
                    name: "VIX Level",
                    category: "market",
                    passed: true,
                    value: "N/A".to_string(),
                    limit: format!("<{limit:.0}"),
                    description: "Could not fetch VIX level".to_string(),
                    severity: Severity::Info,
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // 11. Graduated drawdown scaling
    // -------------------------------------------------------------------------

    /// Position-scale ladder by how much of the drawdown budget is used:
    /// < 25% → 1.0, < 50% → 0.75, < 75% → 0.50, else 0.30. Never a blocker
    /// — the hard cut-off is check 7's job.
    pub fn check_drawdown_graduated(&self, portfolio: &PortfolioState) -> (RiskCheck, f64) {
        let drawdown = drawdown_of(portfolio, self.config.initial_budget);
        let dd_ratio = if self.config.max_drawdown > 0.0 {
            drawdown / self.config.max_drawdown
        } else {
            0.0
        };

        let (scale, severity, label) = if dd_ratio < 0.25 {
            (1.0, Severity::Info, "minimal, full position sizing")
        } else if dd_ratio < 0.50 {
            (0.75, Severity::Warning, "moderate, reducing positions to 75%")
        } else if dd_ratio < 0.75 {
            (0.50, Severity::Warning, "elevated, reducing positions to 50%")
        } else {
            (0.30, Severity::Warning, "severe, reducing positions to 30%")
        };

        let check = RiskCheck {
            name: "Drawdown Scaling",
            category: "risk_scaling",
            passed: true,
            value: format!("{:.1}% ({:.0}% of limit)", drawdown * 100.0, dd_ratio * 100.0),
            limit: format!("{:.1}%", self.config.max_drawdown * 100.0),
            description: format!("Drawdown {:.1}% — {label}", drawdown * 100.0),
            severity,
        };
        (check, scale)
    }
}

/// Current drawdown of a portfolio from its peak value.
fn drawdown_of(portfolio: &PortfolioState, fallback_budget: f64) -> f64 {
    let max_value = if portfolio.max_value > 0.0 {
        portfolio.max_value
    } else {
        fallback_budget
    };
    let current = if portfolio.total_value > 0.0 {
        portfolio.total_value
    } else {
        fallback_budget
    };
    if max_value > 0.0 {
        (max_value - current) / max_value
    } else {
        0.0
    }
}

// =============================================================================
// Trading window
// =============================================================================

/// Resolved trading window verdict for the current instant.
pub struct WindowVerdict {
    pub within: bool,
    pub current: String,
    pub limit: String,
}

/// Evaluate the trading window against the current time in the configured
/// timezone.
pub fn trading_window_now(config: &TraderConfig) -> anyhow::Result<WindowVerdict> {
    let tz = Tz::from_str(&config.timezone)
        .map_err(|e| anyhow::anyhow!("invalid timezone {}: {e}", config.timezone))?;
    let now = Utc::now().with_timezone(&tz);
    let weekday = now.format("%a").to_string().to_lowercase();
    let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
        .ok_or_else(|| anyhow::anyhow!("invalid local time"))?;
    evaluate_window(config, &weekday, time)
}

/// Pure window evaluation: trading day, then `[start + open_buffer,
/// end − close_buffer]`.
pub fn evaluate_window(
    config: &TraderConfig,
    weekday: &str,
    time: NaiveTime,
) -> anyhow::Result<WindowVerdict> {
    if !config.trading_days.iter().any(|d| d == weekday) {
        return Ok(WindowVerdict {
            within: false,
            current: weekday.to_string(),
            limit: config.trading_days.join(", "),
        });
    }

    let start = NaiveTime::parse_from_str(&config.trading_start, "%H:%M")
        .map_err(|e| anyhow::anyhow!("invalid trading_start: {e}"))?;
    let end = NaiveTime::parse_from_str(&config.trading_end, "%H:%M")
        .map_err(|e| anyhow::anyhow!("invalid trading_end: {e}"))?;

    let start_buffer = start + chrono::Duration::minutes(config.avoid_market_open);
    let end_buffer = end - chrono::Duration::minutes(config.avoid_market_close);

    Ok(WindowVerdict {
        within: time >= start_buffer && time <= end_buffer,
        current: time.format("%H:%M").to_string(),
        limit: format!(
            "{}-{}",
            start_buffer.format("%H:%M"),
            end_buffer.format("%H:%M")
        ),
    })
}

/// Whether the trader may act right now (schedule disabled always passes).
pub fn is_trading_time(config: &TraderConfig) -> bool {
    if !config.schedule_enabled {
        return true;
    }
    trading_window_now(config)
        .map(|w| w.within)
        .unwrap_or(false)
}
