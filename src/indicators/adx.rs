// =============================================================================
// Average Directional Index (ADX) with +DI / −DI
// =============================================================================
//
// Wilder's directional movement system:
//   +DM = high − prev_high   (when it exceeds the down-move, else 0)
//   −DM = prev_low − low     (when it exceeds the up-move, else 0)
//   ±DI = 100 × smoothed(±DM) / smoothed(TR)
//   DX  = 100 × |+DI − −DI| / (+DI + −DI)
//   ADX = Wilder-smoothed DX
// =============================================================================

use crate::types::Bar;

/// Directional series aligned to `bars`.
pub struct AdxSeries {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

/// Compute ADX, +DI and −DI with the given `period`.
pub fn adx(bars: &[Bar], period: usize) -> AdxSeries {
    let n = bars.len();
    let mut out = AdxSeries {
        adx: vec![f64::NAN; n],
        plus_di: vec![f64::NAN; n],
        minus_di: vec![f64::NAN; n],
    };
    if period == 0 || n < 2 * period + 1 {
        return out;
    }

    let mut tr = vec![0.0; n];
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];

    for i in 1..n {
        let up = bars[i].high - bars[i - 1].high;
        let down = bars[i - 1].low - bars[i].low;
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };

        let prev_close = bars[i - 1].close;
        tr[i] = (bars[i].high - bars[i].low)
            .max((bars[i].high - prev_close).abs())
            .max((bars[i].low - prev_close).abs());
    }

    // Wilder smoothing: seed with plain sums of the first `period` values.
    let mut tr_s: f64 = tr[1..=period].iter().sum();
    let mut plus_s: f64 = plus_dm[1..=period].iter().sum();
    let mut minus_s: f64 = minus_dm[1..=period].iter().sum();

    let mut dx = vec![f64::NAN; n];
    for i in period..n {
        if i > period {
            tr_s = tr_s - tr_s / period as f64 + tr[i];
            plus_s = plus_s - plus_s / period as f64 + plus_dm[i];
            minus_s = minus_s - minus_s / period as f64 + minus_dm[i];
        }

        if tr_s > f64::EPSILON {
            out.plus_di[i] = 100.0 * plus_s / tr_s;
            out.minus_di[i] = 100.0 * minus_s / tr_s;
        } else {
            out.plus_di[i] = 0.0;
            out.minus_di[i] = 0.0;
        }

        let di_sum = out.plus_di[i] + out.minus_di[i];
        dx[i] = if di_sum > f64::EPSILON {
            100.0 * (out.plus_di[i] - out.minus_di[i]).abs() / di_sum
        } else {
            0.0
        };
    }

    // ADX: Wilder-smoothed DX, seeded with the mean of the first `period` DX
    // values.
    let first_adx_idx = 2 * period - 1;
    let mut current: f64 =
        dx[period..period + period].iter().sum::<f64>() / period as f64;
    out.adx[first_adx_idx] = current;
    for i in (first_adx_idx + 1)..n {
        current = (current * (period as f64 - 1.0) + dx[i]) / period as f64;
        out.adx[i] = current;
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trending_bars(n: usize, slope: f64) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + slope * i as f64;
                Bar {
                    timestamp: i as i64,
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    #[test]
    fn adx_insufficient_data_all_nan() {
        let series = adx(&trending_bars(20, 1.0), 14);
        assert!(series.adx.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn strong_uptrend_plus_di_dominates() {
        let series = adx(&trending_bars(80, 2.0), 14);
        let last = series.adx.len() - 1;
        assert!(series.plus_di[last] > series.minus_di[last]);
        assert!(series.adx[last] > 25.0, "trend should register as strong");
    }

    #[test]
    fn strong_downtrend_minus_di_dominates() {
        let series = adx(&trending_bars(80, -2.0), 14);
        let last = series.adx.len() - 1;
        assert!(series.minus_di[last] > series.plus_di[last]);
    }

    #[test]
    fn di_values_bounded() {
        let series = adx(&trending_bars(80, 0.5), 14);
        for i in 0..series.adx.len() {
            if !series.plus_di[i].is_nan() {
                assert!((0.0..=100.0).contains(&series.plus_di[i]));
                assert!((0.0..=100.0).contains(&series.minus_di[i]));
            }
            if !series.adx[i].is_nan() {
                assert!((0.0..=100.0).contains(&series.adx[i]));
            }
        }
    }
}
