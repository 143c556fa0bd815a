// =============================================================================
// Moving Averages — SMA, EMA and pandas-style exponential smoothing
// =============================================================================

/// Simple moving average. Slots before `period - 1` are NaN.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = sum / period as f64;
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = sum / period as f64;
    }
    out
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values. Slots before `period - 1` are NaN.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut current: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = current;
    for i in period..values.len() {
        current = (values[i] - current) * alpha + current;
        out[i] = current;
    }
    out
}

/// Exponentially weighted mean over the whole series (pandas
/// `ewm(span=..., adjust=False)`): starts at the first value, no warm-up
/// NaNs. NaN inputs are carried through without updating the state.
pub fn ewm_span(values: &[f64], span: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if span == 0 || values.is_empty() {
        return out;
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut state: Option<f64> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            out[i] = state.unwrap_or(f64::NAN);
            continue;
        }
        let next = match state {
            None => v,
            Some(prev) => (v - prev) * alpha + prev,
        };
        state = Some(next);
        out[i] = next;
    }
    out
}

/// Rolling mean over a window. Slots before `period - 1` are NaN.
pub fn rolling_mean(values: &[f64], period: usize) -> Vec<f64> {
    sma(values, period)
}

/// Rolling (population) standard deviation. Slots before `period - 1` are
/// NaN.
pub fn rolling_std(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        out[i] = var.sqrt();
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_warmup_is_nan() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 2.0).abs() < 1e-12);
        assert!((out[3] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn sma_insufficient_data_all_nan() {
        let out = sma(&[1.0, 2.0], 5);
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn sma_period_zero_all_nan() {
        assert!(sma(&[1.0, 2.0], 0).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ema_constant_series_is_constant() {
        let out = ema(&[5.0; 30], 12);
        for &v in &out[11..] {
            assert!((v - 5.0).abs() < 1e-12);
        }
    }

    #[test]
    fn ema_tracks_trend_above_sma() {
        // In a rising series the EMA reacts faster than the SMA.
        let values: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        let e = ema(&values, 10);
        let s = sma(&values, 10);
        assert!(e.last().unwrap() > s.last().unwrap());
    }

    #[test]
    fn ewm_span_starts_at_first_value() {
        let out = ewm_span(&[10.0, 11.0, 12.0], 20);
        assert!((out[0] - 10.0).abs() < 1e-12);
        assert!(out[1] > 10.0 && out[1] < 11.0);
    }

    #[test]
    fn rolling_std_flat_series_is_zero() {
        let out = rolling_std(&[3.0; 25], 20);
        assert!(out[19].abs() < 1e-12);
        assert!(out[0].is_nan());
    }

    #[test]
    fn aligned_lengths() {
        let values: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        assert_eq!(sma(&values, 20).len(), 40);
        assert_eq!(ema(&values, 12).len(), 40);
        assert_eq!(ewm_span(&values, 9).len(), 40);
        assert_eq!(rolling_std(&values, 20).len(), 40);
    }
}
