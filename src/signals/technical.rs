// =============================================================================
// Technical signal — local scoring from raw backend bars
// =============================================================================
//
// Three indicator scores, averaged:
//   RSI band:   <30 → +0.8, 30–40 → +0.4, >70 → −0.8, 60–70 → −0.4, else 0
//   MACD hist:  sign → ±0.5
//   MA stack:   close > SMA20 > SMA50 → +0.7; close > SMA20 → +0.3;
//               mirrored for the bearish side
//
// Confidence = max(0.3, 1 − std(scores)) — tighter indicator agreement reads
// as higher confidence.
// =============================================================================

use serde_json::json;

use crate::indicators::macd::macd_last;
use crate::indicators::rsi::rsi_last_simple;
use crate::signals::SourceSignal;
use crate::types::Bar;

/// Minimum bars required before the technical source contributes.
pub const MIN_BARS: usize = 60;

/// Compute the technical signal from raw bars.
pub fn technical_signal(bars: &[Bar]) -> SourceSignal {
    if bars.len() < MIN_BARS {
        return SourceSignal::unavailable("insufficient data (need 60+ points)");
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let current_price = *closes.last().unwrap_or(&0.0);

    let rsi = rsi_last_simple(&closes, 14);
    let (macd, macd_signal, macd_hist) = macd_last(&closes, 12, 26, 9);
    let sma_20 = trailing_mean(&closes, 20);
    let sma_50 = trailing_mean(&closes, 50);

    // RSI band score.
    let rsi_score = if rsi < 30.0 {
        0.8
    } else if rsi < 40.0 {
        0.4
    } else if rsi > 70.0 {
        -0.8
    } else if rsi > 60.0 {
        -0.4
    } else {
        0.0
    };

    // MACD histogram sign.
    let macd_score = if macd_hist > 0.0 {
        0.5
    } else if macd_hist < 0.0 {
        -0.5
    } else {
        0.0
    };

    // Moving-average stack.
    let ma_score = if current_price > sma_20 && sma_20 > sma_50 {
        0.7
    } else if current_price > sma_20 {
        0.3
    } else if current_price < sma_20 && sma_20 < sma_50 {
        -0.7
    } else if current_price < sma_20 {
        -0.3
    } else {
        0.0
    };

    let scores = [rsi_score, macd_score, ma_score];
    let score = scores.iter().sum::<f64>() / scores.len() as f64;
    let mean = score;
    let std = (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64).sqrt();
    let confidence = (1.0 - std).max(0.3);

    let trend = if ma_score > 0.3 {
        "bullish"
    } else if ma_score < -0.3 {
        "bearish"
    } else {
        "neutral"
    };

    SourceSignal {
        score,
        confidence,
        details: json!({
            "rsi": rsi,
            "rsi_signal": if rsi < 30.0 { "oversold" } else if rsi > 70.0 { "overbought" } else { "neutral" },
            "macd": macd,
            "macd_signal": macd_signal,
            "macd_hist": macd_hist,
            "sma_20": sma_20,
            "sma_50": sma_50,
            "current_price": current_price,
            "trend": trend,
        }),
    }
}

/// Mean of the trailing `n` values (whole series when shorter).
fn trailing_mean(values: &[f64], n: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let tail = &values[values.len().saturating_sub(n)..];
    tail.iter().sum::<f64>() / tail.len() as f64
}
