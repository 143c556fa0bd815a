// =============================================================================
// Transaction costs — broker fee profiles and slippage models
// =============================================================================
//
// Commission = clamp(flat_fee + value × pct_fee, min_fee, max_fee)
//              + exchange_fee
// Spread cost = value × spread_pct
//
// Slippage is returned as a dollar cost on the trade value; the execution
// price moves against the trade by slippage / shares.
// =============================================================================

use rand::Rng;

use crate::agent_config::{BrokerProfile, SlippageModel};

/// Fee parameters of one broker profile. Percent fields are whole percents.
#[derive(Debug, Clone, Copy)]
pub struct BrokerFees {
    pub flat_fee: f64,
    pub percentage_fee: f64,
    pub min_fee: f64,
    pub max_fee: f64,
    pub exchange_fee: f64,
    pub spread_percent: f64,
}

impl BrokerFees {
    /// Fee table matching the backend's broker profiles.
    pub fn for_profile(profile: BrokerProfile) -> Self {
        match profile {
            BrokerProfile::Discount => Self {
                flat_fee: 1.00,
                percentage_fee: 0.0,
                min_fee: 1.00,
                max_fee: 1.00,
                exchange_fee: 0.0,
                spread_percent: 0.10,
            },
            BrokerProfile::Standard => Self {
                flat_fee: 4.95,
                percentage_fee: 0.25,
                min_fee: 4.95,
                max_fee: 59.00,
                exchange_fee: 0.0,
                spread_percent: 0.15,
            },
            BrokerProfile::Premium => Self {
                flat_fee: 9.90,
                percentage_fee: 0.0,
                min_fee: 9.90,
                max_fee: 9.90,
                exchange_fee: 0.0,
                spread_percent: 0.05,
            },
            BrokerProfile::MarketMaker => Self {
                flat_fee: 0.0,
                percentage_fee: 0.0,
                min_fee: 0.0,
                max_fee: 0.0,
                exchange_fee: 0.0,
                spread_percent: 0.30,
            },
            BrokerProfile::Flatex => Self {
                flat_fee: 8.50,
                percentage_fee: 0.0,
                min_fee: 8.50,
                max_fee: 8.50,
                exchange_fee: 0.0,
                spread_percent: 0.05,
            },
            BrokerProfile::IngDiba => Self {
                flat_fee: 5.30,
                percentage_fee: 0.25,
                min_fee: 10.70,
                max_fee: 75.50,
                exchange_fee: 2.05,
                spread_percent: 0.05,
            },
        }
    }

    /// Total cost of one trade of `trade_value` dollars.
    pub fn transaction_cost(&self, trade_value: f64) -> f64 {
        let percentage_part = trade_value * self.percentage_fee / 100.0;
        let commission =
            (self.flat_fee + percentage_part).clamp(self.min_fee, self.max_fee) + self.exchange_fee;
        let spread_cost = trade_value * self.spread_percent / 100.0;
        commission + spread_cost
    }
}

/// Dollar slippage cost on a trade of `trade_value`.
///
/// - `fixed`: value × bps.
/// - `proportional`: value × bps × Uniform(0.7, 1.3).
/// - `volume`: value × bps × (1 + 10·√(shares / bar_volume)) — market
///   impact grows with the traded share of the bar's volume. Falls back to
///   2× bps when the bar has no volume.
pub fn slippage_cost<R: Rng>(
    model: SlippageModel,
    bps: f64,
    trade_value: f64,
    price: f64,
    bar_volume: f64,
    rng: &mut R,
) -> f64 {
    match model {
        SlippageModel::None => 0.0,
        SlippageModel::Fixed => trade_value * (bps / 10_000.0),
        SlippageModel::Proportional => {
            let jitter = 1.0 + (rng.gen::<f64>() - 0.5) * 0.6;
            trade_value * (bps / 10_000.0) * jitter
        }
        SlippageModel::Volume => {
            let impact_bps = if bar_volume > 0.0 && price > 0.0 {
                let shares = trade_value / price;
                bps * (1.0 + 10.0 * (shares / bar_volume).sqrt())
            } else {
                bps * 2.0
            };
            trade_value * (impact_bps / 10_000.0)
        }
    }
}

/// Execution price after slippage: base ± slippage-per-share depending on
/// the trade direction.
pub fn execution_price<R: Rng>(
    model: SlippageModel,
    bps: f64,
    base_price: f64,
    trade_value: f64,
    bar_volume: f64,
    is_buy: bool,
    rng: &mut R,
) -> f64 {
    let slip = slippage_cost(model, bps, trade_value, base_price, bar_volume, rng);
    let shares = (trade_value / base_price).max(1.0);
    let per_share = slip / shares;
    if is_buy {
        base_price + per_share
    } else {
        base_price - per_share
    }
}
