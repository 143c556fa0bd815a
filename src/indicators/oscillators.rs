// =============================================================================
// Oscillators — Stochastic %K/%D, CCI and MFI
// =============================================================================

use crate::indicators::ema::rolling_mean;
use crate::types::Bar;

/// Stochastic oscillator: raw %K over `period` highs/lows, %D as the
/// `smooth`-bar rolling mean of %K. Both aligned to `bars`.
pub fn stochastic(bars: &[Bar], period: usize, smooth: usize) -> (Vec<f64>, Vec<f64>) {
    let n = bars.len();
    let mut k = vec![f64::NAN; n];
    if period == 0 || n < period {
        return (k.clone(), k);
    }

    for i in (period - 1)..n {
        let window = &bars[i + 1 - period..=i];
        let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let range = hh - ll;
        k[i] = if range > f64::EPSILON {
            (bars[i].close - ll) / range * 100.0
        } else {
            50.0
        };
    }

    // %D ignores the NaN warm-up region.
    let valid: Vec<f64> = k[period - 1..].to_vec();
    let d_tail = rolling_mean(&valid, smooth);
    let mut d = vec![f64::NAN; n];
    for (j, &v) in d_tail.iter().enumerate() {
        d[period - 1 + j] = v;
    }

    (k, d)
}

/// Commodity Channel Index over typical prices.
///
/// CCI = (TP − SMA(TP)) / (0.015 × mean deviation)
pub fn cci(bars: &[Bar], period: usize) -> Vec<f64> {
    let n = bars.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }

    let tp: Vec<f64> = bars
        .iter()
        .map(|b| (b.high + b.low + b.close) / 3.0)
        .collect();

    for i in (period - 1)..n {
        let window = &tp[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let mean_dev = window.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
        out[i] = if mean_dev > f64::EPSILON {
            (tp[i] - mean) / (0.015 * mean_dev)
        } else {
            0.0
        };
    }

    out
}

/// Money Flow Index — volume-weighted RSI analogue over typical prices.
pub fn mfi(bars: &[Bar], period: usize) -> Vec<f64> {
    let n = bars.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let tp: Vec<f64> = bars
        .iter()
        .map(|b| (b.high + b.low + b.close) / 3.0)
        .collect();

    // Signed raw money flow per bar (index 0 has no direction).
    let mut flow = vec![0.0; n];
    for i in 1..n {
        let raw = tp[i] * bars[i].volume;
        flow[i] = if tp[i] > tp[i - 1] {
            raw
        } else if tp[i] < tp[i - 1] {
            -raw
        } else {
            0.0
        };
    }

    for i in period..n {
        let window = &flow[i + 1 - period..=i];
        let positive: f64 = window.iter().filter(|&&f| f > 0.0).sum();
        let negative: f64 = window.iter().filter(|&&f| f < 0.0).map(|f| f.abs()).sum();
        out[i] = if negative < f64::EPSILON {
            if positive < f64::EPSILON {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + positive / negative)
        };
    }

    out
}
