// =============================================================================
// Shared types used across the Meridian trading service
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One OHLCV record at daily granularity, as parsed from the backend's
/// chart endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    /// Unix timestamp in milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Final verdict of the decision engine for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionType {
    Buy,
    Sell,
    Hold,
    Close,
    Skip,
    Short,
}

impl DecisionType {
    /// True for decisions that open a new position.
    pub fn opens_position(&self) -> bool {
        matches!(self, Self::Buy | Self::Short)
    }

    /// True for decisions that reach the execution endpoint.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Buy | Self::Sell | Self::Short | Self::Close)
    }
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Hold => "hold",
            Self::Close => "close",
            Self::Skip => "skip",
            Self::Short => "short",
        };
        write!(f, "{s}")
    }
}

/// Side of an open position. The backend stores `quantity` non-negative, so
/// this field is authoritative for direction everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl Default for PositionSide {
    fn default() -> Self {
        Self::Long
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Categorical strength of directional consensus across the signal sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agreement {
    Strong,
    Moderate,
    Weak,
    Mixed,
}

impl Agreement {
    /// Ordering used by the multiple-confirmation gate (mixed < weak <
    /// moderate < strong).
    pub fn rank(&self) -> u8 {
        match self {
            Self::Mixed => 0,
            Self::Weak => 1,
            Self::Moderate => 2,
            Self::Strong => 3,
        }
    }

    /// Confidence multiplier applied to the mean source confidence.
    pub fn confidence_multiplier(&self) -> f64 {
        match self {
            Self::Strong => 1.2,
            Self::Moderate => 1.0,
            Self::Weak => 0.8,
            Self::Mixed => 0.6,
        }
    }
}

impl std::fmt::Display for Agreement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strong => write!(f, "strong"),
            Self::Moderate => write!(f, "moderate"),
            Self::Weak => write!(f, "weak"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

/// Trading horizon of a live trader. Steers decision thresholds and the
/// minimum holding floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingHorizon {
    Scalping,
    Day,
    Swing,
    Position,
}

impl Default for TradingHorizon {
    fn default() -> Self {
        Self::Day
    }
}

impl TradingHorizon {
    /// Minimum minutes a position must be held before the engine may close
    /// it. SL/TP sweeps bypass this floor.
    pub fn min_holding_minutes(&self) -> i64 {
        match self {
            Self::Scalping => 15,
            Self::Day => 30,
            Self::Swing => 60,
            Self::Position => 120,
        }
    }
}

impl std::fmt::Display for TradingHorizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalping => write!(f, "scalping"),
            Self::Day => write!(f, "day"),
            Self::Swing => write!(f, "swing"),
            Self::Position => write!(f, "position"),
        }
    }
}

/// Strength ladder reported by RL inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStrength {
    Weak,
    Moderate,
    Strong,
    Neutral,
}

impl std::fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weak => write!(f, "weak"),
            Self::Moderate => write!(f, "moderate"),
            Self::Strong => write!(f, "strong"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

// =============================================================================
// Portfolio snapshot (consumed from the backend)
// =============================================================================

/// One open position as reported by the backend portfolio endpoint.
/// `quantity` is always non-negative; `side` carries the direction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PositionSnapshot {
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub side: PositionSide,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    /// ISO 8601 timestamp of when the position was opened.
    #[serde(default)]
    pub opened_at: Option<String>,
    #[serde(default)]
    pub market_value: f64,
    #[serde(default)]
    pub value: f64,
}

/// Full portfolio state for one trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    #[serde(default)]
    pub cash: f64,
    #[serde(default)]
    pub total_value: f64,
    #[serde(default)]
    pub total_invested: f64,
    #[serde(default)]
    pub positions_count: u32,
    #[serde(default)]
    pub positions: HashMap<String, PositionSnapshot>,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_pnl_pct: f64,
    #[serde(default)]
    pub max_value: f64,
}

impl PortfolioState {
    /// Flat default used when the backend is unreachable; the trader keeps
    /// ticking against an empty book.
    pub fn default_with_budget(budget: f64) -> Self {
        Self {
            cash: budget,
            total_value: budget,
            total_invested: 0.0,
            positions_count: 0,
            positions: HashMap::new(),
            daily_pnl: 0.0,
            daily_pnl_pct: 0.0,
            max_value: budget,
        }
    }

    /// Number of open short positions, judged by `side`.
    pub fn short_count(&self) -> usize {
        self.positions
            .values()
            .filter(|p| p.side == PositionSide::Short)
            .count()
    }

    /// Total absolute market value held short, judged by `side`.
    pub fn short_exposure(&self) -> f64 {
        self.positions
            .values()
            .filter(|p| p.side == PositionSide::Short)
            .map(|p| p.market_value.abs())
            .sum()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_type_serde_lowercase() {
        assert_eq!(serde_json::to_string(&DecisionType::Buy).unwrap(), "\"buy\"");
        assert_eq!(serde_json::to_string(&DecisionType::Short).unwrap(), "\"short\"");
        let d: DecisionType = serde_json::from_str("\"close\"").unwrap();
        assert_eq!(d, DecisionType::Close);
    }

    #[test]
    fn decision_type_classification() {
        assert!(DecisionType::Buy.opens_position());
        assert!(DecisionType::Short.opens_position());
        assert!(!DecisionType::Sell.opens_position());
        assert!(DecisionType::Close.is_executable());
        assert!(!DecisionType::Skip.is_executable());
        assert!(!DecisionType::Hold.is_executable());
    }

    #[test]
    fn agreement_rank_ordering() {
        assert!(Agreement::Mixed.rank() < Agreement::Weak.rank());
        assert!(Agreement::Weak.rank() < Agreement::Moderate.rank());
        assert!(Agreement::Moderate.rank() < Agreement::Strong.rank());
    }

    #[test]
    fn horizon_min_holding_floors() {
        assert_eq!(TradingHorizon::Scalping.min_holding_minutes(), 15);
        assert_eq!(TradingHorizon::Day.min_holding_minutes(), 30);
        assert_eq!(TradingHorizon::Swing.min_holding_minutes(), 60);
        assert_eq!(TradingHorizon::Position.min_holding_minutes(), 120);
    }

    #[test]
    fn position_side_default_is_long() {
        let snap: PositionSnapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(snap.side, PositionSide::Long);
    }

    #[test]
    fn short_exposure_uses_side_not_sign() {
        let json = r#"{
            "positions": {
                "AAPL": {"quantity": 10, "side": "long", "market_value": 1000},
                "TSLA": {"quantity": 5, "side": "short", "market_value": 2000}
            }
        }"#;
        let p: PortfolioState = serde_json::from_str(json).unwrap();
        assert_eq!(p.short_count(), 1);
        assert!((p.short_exposure() - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn portfolio_default_with_budget() {
        let p = PortfolioState::default_with_budget(50_000.0);
        assert!((p.cash - 50_000.0).abs() < f64::EPSILON);
        assert!((p.max_value - 50_000.0).abs() < f64::EPSILON);
        assert!(p.positions.is_empty());
    }
}
