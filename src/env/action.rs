// =============================================================================
// Discrete action space for the trading environment (long + short)
// =============================================================================

use serde::{Deserialize, Serialize};

/// Discrete trading actions. The first 7 are always available; the short
/// block (7..=12) only when short selling is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(usize)]
pub enum Action {
    Hold = 0,
    /// Buy 10% of available capital.
    BuySmall = 1,
    /// Buy 25% of available capital.
    BuyMedium = 2,
    /// Buy 50% of available capital.
    BuyLarge = 3,
    /// Sell 25% of the position.
    SellSmall = 4,
    /// Sell 50% of the position.
    SellMedium = 5,
    /// Close the entire position.
    SellAll = 6,
    /// Short-sell 10% of capital.
    ShortSmall = 7,
    /// Short-sell 25% of capital.
    ShortMedium = 8,
    /// Short-sell 50% of capital.
    ShortLarge = 9,
    /// Cover 25% of the short position.
    CoverSmall = 10,
    /// Cover 50% of the short position.
    CoverMedium = 11,
    /// Cover the entire short position.
    CoverAll = 12,
}

/// Number of actions without short selling.
pub const N_ACTIONS_LONG_ONLY: usize = 7;
/// Number of actions with short selling enabled.
pub const N_ACTIONS_WITH_SHORTS: usize = 13;

impl Action {
    /// Decode an action index; indices in the short block are only valid
    /// when `shorts_enabled`.
    pub fn from_index(index: usize, shorts_enabled: bool) -> Option<Action> {
        let limit = if shorts_enabled {
            N_ACTIONS_WITH_SHORTS
        } else {
            N_ACTIONS_LONG_ONLY
        };
        if index >= limit {
            return None;
        }
        Some(match index {
            0 => Self::Hold,
            1 => Self::BuySmall,
            2 => Self::BuyMedium,
            3 => Self::BuyLarge,
            4 => Self::SellSmall,
            5 => Self::SellMedium,
            6 => Self::SellAll,
            7 => Self::ShortSmall,
            8 => Self::ShortMedium,
            9 => Self::ShortLarge,
            10 => Self::CoverSmall,
            11 => Self::CoverMedium,
            _ => Self::CoverAll,
        })
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Fraction of cash committed by a buy/short entry.
    pub fn entry_fraction(&self) -> Option<f64> {
        match self {
            Self::BuySmall | Self::ShortSmall => Some(0.10),
            Self::BuyMedium | Self::ShortMedium => Some(0.25),
            Self::BuyLarge | Self::ShortLarge => Some(0.50),
            _ => None,
        }
    }

    /// Fraction of the current position closed by a sell/cover.
    pub fn exit_fraction(&self) -> Option<f64> {
        match self {
            Self::SellSmall | Self::CoverSmall => Some(0.25),
            Self::SellMedium | Self::CoverMedium => Some(0.50),
            Self::SellAll | Self::CoverAll => Some(1.0),
            _ => None,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Self::BuySmall | Self::BuyMedium | Self::BuyLarge)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Self::SellSmall | Self::SellMedium | Self::SellAll)
    }

    pub fn is_short(&self) -> bool {
        matches!(self, Self::ShortSmall | Self::ShortMedium | Self::ShortLarge)
    }

    pub fn is_cover(&self) -> bool {
        matches!(self, Self::CoverSmall | Self::CoverMedium | Self::CoverAll)
    }

    /// Snake-case name used in trade histories and API payloads.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::BuySmall => "buy_small",
            Self::BuyMedium => "buy_medium",
            Self::BuyLarge => "buy_large",
            Self::SellSmall => "sell_small",
            Self::SellMedium => "sell_medium",
            Self::SellAll => "sell_all",
            Self::ShortSmall => "short_small",
            Self::ShortMedium => "short_medium",
            Self::ShortLarge => "short_large",
            Self::CoverSmall => "cover_small",
            Self::CoverMedium => "cover_medium",
            Self::CoverAll => "cover_all",
        }
    }
}
