// =============================================================================
// Bollinger Bands — rolling mean ± k standard deviations
// =============================================================================

use crate::indicators::ema::{rolling_mean, rolling_std};

/// All five Bollinger series aligned to `closes`.
pub struct BollingerSeries {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
    /// (upper − lower) / middle
    pub width: Vec<f64>,
    /// (close − lower) / (upper − lower), the %B position inside the bands.
    pub pct: Vec<f64>,
}

/// Compute Bollinger Bands with the given `period` and deviation factor `k`.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> BollingerSeries {
    let n = closes.len();
    let middle = rolling_mean(closes, period);
    let std = rolling_std(closes, period);

    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    let mut width = vec![f64::NAN; n];
    let mut pct = vec![f64::NAN; n];

    for i in 0..n {
        if middle[i].is_nan() || std[i].is_nan() {
            continue;
        }
        upper[i] = middle[i] + k * std[i];
        lower[i] = middle[i] - k * std[i];
        if middle[i].abs() > f64::EPSILON {
            width[i] = (upper[i] - lower[i]) / middle[i];
        }
        let band = upper[i] - lower[i];
        if band.abs() > f64::EPSILON {
            pct[i] = (closes[i] - lower[i]) / band;
        } else {
            pct[i] = 0.5;
        }
    }

    BollingerSeries {
        upper,
        middle,
        lower,
        width,
        pct,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_bracket_the_mean() {
        let closes: Vec<f64> = (0..60)
            .map(|x| 100.0 + (x as f64 * 0.7).sin() * 5.0)
            .collect();
        let bb = bollinger(&closes, 20, 2.0);
        for i in 19..60 {
            assert!(bb.upper[i] >= bb.middle[i]);
            assert!(bb.lower[i] <= bb.middle[i]);
        }
    }

    #[test]
    fn flat_series_collapses_bands() {
        let closes = vec![42.0; 30];
        let bb = bollinger(&closes, 20, 2.0);
        assert!((bb.upper[29] - 42.0).abs() < 1e-12);
        assert!((bb.lower[29] - 42.0).abs() < 1e-12);
        assert!(bb.width[29].abs() < 1e-12);
        // Degenerate band: %B pinned to the midpoint.
        assert!((bb.pct[29] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn warmup_is_nan() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let bb = bollinger(&closes, 20, 2.0);
        assert!(bb.upper[18].is_nan());
        assert!(!bb.upper[19].is_nan());
    }

    #[test]
    fn pct_in_unit_range_for_close_inside_bands() {
        let closes: Vec<f64> = (0..60)
            .map(|x| 100.0 + (x as f64 * 0.3).cos() * 2.0)
            .collect();
        let bb = bollinger(&closes, 20, 2.0);
        for i in 19..60 {
            assert!(bb.pct[i] > -0.5 && bb.pct[i] < 1.5);
        }
    }
}
