// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing
// =============================================================================
//
// True Range = max(high − low, |high − prev_close|, |low − prev_close|)
// ATR seeds with the SMA of the first `period` true ranges, then applies
// Wilder's smoothing.
// =============================================================================

use crate::types::Bar;

/// ATR series aligned to `bars`; slots before index `period` are NaN.
pub fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; bars.len()];
    if period == 0 || bars.len() < period + 1 {
        return out;
    }

    let tr: Vec<f64> = true_ranges(bars);

    let period_f = period as f64;
    let mut current: f64 = tr[1..=period].iter().sum::<f64>() / period_f;
    out[period] = current;

    for i in (period + 1)..bars.len() {
        current = (current * (period_f - 1.0) + tr[i]) / period_f;
        out[i] = current;
    }

    out
}

/// True range per bar; index 0 falls back to high − low.
fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, b)| {
            if i == 0 {
                b.high - b.low
            } else {
                let prev_close = bars[i - 1].close;
                (b.high - b.low)
                    .max((b.high - prev_close).abs())
                    .max((b.low - prev_close).abs())
            }
        })
        .collect()
}

/// Latest ATR as a percent of the latest close, for volatility-aware
/// position sizing. `None` when there is not enough data.
pub fn atr_pct_last(bars: &[Bar], period: usize) -> Option<f64> {
    let series = atr(bars, period);
    let last_atr = series.iter().rev().find(|v| !v.is_nan())?;
    let last_close = bars.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some(last_atr / last_close * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: 0,
            open: close,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn atr_insufficient_data_all_nan() {
        let bars: Vec<Bar> = (0..10).map(|_| bar(101.0, 99.0, 100.0)).collect();
        assert!(atr(&bars, 14).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_constant_range() {
        // Every bar spans exactly 2.0 with no gaps: ATR must be 2.0.
        let bars: Vec<Bar> = (0..30).map(|_| bar(101.0, 99.0, 100.0)).collect();
        let series = atr(&bars, 14);
        for &v in series.iter().filter(|v| !v.is_nan()) {
            assert!((v - 2.0).abs() < 1e-10);
        }
    }

    #[test]
    fn atr_gap_expands_true_range() {
        let mut bars: Vec<Bar> = (0..20).map(|_| bar(101.0, 99.0, 100.0)).collect();
        // Gap up: previous close 100, new low 110.
        bars.push(bar(112.0, 110.0, 111.0));
        let series = atr(&bars, 14);
        let last = series.last().unwrap();
        assert!(*last > 2.0);
    }

    #[test]
    fn atr_pct_last_scales_with_close() {
        let bars: Vec<Bar> = (0..30).map(|_| bar(102.0, 98.0, 100.0)).collect();
        let pct = atr_pct_last(&bars, 14).unwrap();
        assert!((pct - 4.0).abs() < 1e-9);
    }

    #[test]
    fn atr_pct_last_none_on_short_input() {
        let bars: Vec<Bar> = (0..5).map(|_| bar(102.0, 98.0, 100.0)).collect();
        assert!(atr_pct_last(&bars, 14).is_none());
    }
}
