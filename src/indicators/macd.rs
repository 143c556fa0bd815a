// =============================================================================
// MACD — Moving Average Convergence / Divergence
// =============================================================================
//
// MACD line  = EMA(fast) − EMA(slow)
// Signal     = EMA(signal) of the MACD line
// Histogram  = MACD line − Signal
// =============================================================================

use crate::indicators::ema::{ema, ewm_span};

/// MACD line, signal line and histogram, all aligned to `closes`.
pub fn macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = closes.len();
    let ema_fast = ema(closes, fast);
    let ema_slow = ema(closes, slow);

    let mut line = vec![f64::NAN; n];
    for i in 0..n {
        if !ema_fast[i].is_nan() && !ema_slow[i].is_nan() {
            line[i] = ema_fast[i] - ema_slow[i];
        }
    }

    let signal_line = ewm_span(&line, signal);

    let mut hist = vec![f64::NAN; n];
    for i in 0..n {
        if !line[i].is_nan() && !signal_line[i].is_nan() {
            hist[i] = line[i] - signal_line[i];
        }
    }

    (line, signal_line, hist)
}

/// Latest (macd, signal, histogram) triple over raw closes, for the
/// technical signal source. Zeroes when there is not enough data.
pub fn macd_last(closes: &[f64], fast: usize, slow: usize, signal: usize) -> (f64, f64, f64) {
    if closes.len() < slow {
        return (0.0, 0.0, 0.0);
    }
    let (line, sig, hist) = macd(closes, fast, slow, signal);
    let last = |v: &[f64]| v.iter().rev().find(|x| !x.is_nan()).copied().unwrap_or(0.0);
    (last(&line), last(&sig), last(&hist))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_alignment_and_warmup() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        let (line, signal, hist) = macd(&closes, 12, 26, 9);
        assert_eq!(line.len(), 60);
        assert_eq!(signal.len(), 60);
        assert_eq!(hist.len(), 60);
        assert!(line[24].is_nan());
        assert!(!line[25].is_nan());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        // Accelerating uptrend: the fast EMA rides above the slow EMA.
        let closes: Vec<f64> = (0..80).map(|x| 100.0 * 1.01_f64.powi(x)).collect();
        let (line, _, hist) = macd(&closes, 12, 26, 9);
        assert!(*line.last().unwrap() > 0.0);
        assert!(*hist.last().unwrap() > 0.0);
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let closes: Vec<f64> = (0..80).map(|x| 100.0 * 0.99_f64.powi(x)).collect();
        let (line, _, _) = macd(&closes, 12, 26, 9);
        assert!(*line.last().unwrap() < 0.0);
    }

    #[test]
    fn macd_flat_series_is_zero() {
        let closes = vec![50.0; 60];
        let (line, signal, hist) = macd(&closes, 12, 26, 9);
        assert!(line.last().unwrap().abs() < 1e-12);
        assert!(signal.last().unwrap().abs() < 1e-12);
        assert!(hist.last().unwrap().abs() < 1e-12);
    }

    #[test]
    fn macd_last_insufficient_data() {
        let (m, s, h) = macd_last(&[1.0, 2.0, 3.0], 12, 26, 9);
        assert_eq!((m, s, h), (0.0, 0.0, 0.0));
    }
}
