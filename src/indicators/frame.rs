// =============================================================================
// Feature Frame — OHLCV bars to indicator matrix
// =============================================================================
//
// Builds the full feature matrix the trading environment and the signal
// layer consume. Column order is fixed; the environment selects the subset
// in `ENV_FEATURE_COLUMNS`.
//
// Fill policy (applied once after all indicators): backward-fill, then
// forward-fill, then zero-fill.
// =============================================================================

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

use crate::indicators::{adx, atr, bollinger, ema, macd, oscillators, rsi, volume};
use crate::types::Bar;

/// Columns the trading environment observes, in order.
pub const ENV_FEATURE_COLUMNS: &[&str] = &[
    "open",
    "high",
    "low",
    "close",
    "volume",
    "returns",
    "log_returns",
    "sma_20",
    "sma_50",
    "sma_200",
    "ema_12",
    "ema_26",
    "rsi",
    "rsi_signal",
    "macd",
    "macd_signal",
    "macd_hist",
    "bb_upper",
    "bb_middle",
    "bb_lower",
    "bb_width",
    "bb_pct",
    "atr",
    "atr_pct",
    "obv",
    "obv_ema",
    "adx",
    "plus_di",
    "minus_di",
    "stoch_k",
    "stoch_d",
    "cci",
    "mfi",
    "volatility",
    "trend_strength",
];

#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("no bars provided")]
    EmptyInput,
}

/// A time-sorted matrix of bars plus derived indicator columns.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    columns: Vec<String>,
    /// rows × columns
    data: Array2<f64>,
    bars: Vec<Bar>,
}

impl FeatureFrame {
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn close(&self, row: usize) -> f64 {
        self.bars[row].close
    }

    pub fn volume(&self, row: usize) -> f64 {
        self.bars[row].volume
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// View of one column, if present.
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.column_index(name).map(|i| self.data.column(i))
    }

    /// Single cell lookup.
    pub fn value(&self, row: usize, name: &str) -> Option<f64> {
        self.column_index(name).map(|i| self.data[[row, i]])
    }

    /// Full matrix view.
    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Copy out the named columns as a dense matrix, skipping any that are
    /// missing. Used by the environment to build its observation matrix.
    pub fn select(&self, names: &[&str]) -> Array2<f64> {
        let idxs: Vec<usize> = names
            .iter()
            .filter_map(|n| self.column_index(n))
            .collect();
        let mut out = Array2::zeros((self.len(), idxs.len()));
        for (j, &src) in idxs.iter().enumerate() {
            out.column_mut(j).assign(&self.data.column(src));
        }
        out
    }

    /// Copy out a contiguous row range as a new frame (walk-forward splits).
    pub fn slice_rows(&self, start: usize, end: usize) -> FeatureFrame {
        let end = end.min(self.len());
        let start = start.min(end);
        let data = self
            .data
            .slice(ndarray::s![start..end, ..])
            .to_owned();
        FeatureFrame {
            columns: self.columns.clone(),
            data,
            bars: self.bars[start..end].to_vec(),
        }
    }

    /// Names of the environment feature columns actually present.
    pub fn env_feature_names(&self) -> Vec<String> {
        ENV_FEATURE_COLUMNS
            .iter()
            .filter(|n| self.column_index(n).is_some())
            .map(|n| n.to_string())
            .collect()
    }
}

/// Build the full feature frame from time-sorted bars.
pub fn calculate_indicators(bars: &[Bar]) -> Result<FeatureFrame, IndicatorError> {
    if bars.is_empty() {
        return Err(IndicatorError::EmptyInput);
    }

    let n = bars.len();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    // Returns
    let mut returns = vec![f64::NAN; n];
    let mut log_returns = vec![f64::NAN; n];
    for i in 1..n {
        if closes[i - 1] != 0.0 {
            returns[i] = closes[i] / closes[i - 1] - 1.0;
            log_returns[i] = (closes[i] / closes[i - 1]).ln();
        }
    }

    // Moving averages
    let sma_20 = ema::sma(&closes, 20);
    let sma_50 = ema::sma(&closes, 50);
    let sma_200 = ema::sma(&closes, 200);
    let ema_12 = ema::ema(&closes, 12);
    let ema_26 = ema::ema(&closes, 26);

    // RSI and its 9-period smoothing. The rolling mean runs on the valid
    // tail so the NaN warm-up does not poison the whole series.
    let rsi_series = rsi::rsi(&closes, 14);
    let rsi_signal = realign_tail(
        &rsi_series,
        &|tail| ema::rolling_mean(tail, 9),
        vec![f64::NAN; n],
    );

    // MACD
    let (macd_line, macd_sig, macd_hist) = macd::macd(&closes, 12, 26, 9);

    // Bollinger
    let bb = bollinger::bollinger(&closes, 20, 2.0);

    // ATR
    let atr_series = atr::atr(bars, 14);
    let mut atr_pct = vec![f64::NAN; n];
    for i in 0..n {
        if !atr_series[i].is_nan() && closes[i] != 0.0 {
            atr_pct[i] = atr_series[i] / closes[i] * 100.0;
        }
    }

    // OBV
    let obv_series = volume::obv(&closes, &volumes);
    let obv_ema = ema::ewm_span(&obv_series, 20);

    // ADX
    let adx_series = adx::adx(bars, 14);

    // Stochastic, CCI, MFI
    let (stoch_k, stoch_d) = oscillators::stochastic(bars, 14, 3);
    let cci_series = oscillators::cci(bars, 20);
    let mfi_series = oscillators::mfi(bars, 14);

    // Annualised rolling volatility of returns
    let vol_tail = realign_tail(
        &returns,
        &|tail| ema::rolling_std(tail, 20),
        vec![f64::NAN; n],
    );
    let volatility: Vec<f64> = vol_tail
        .iter()
        .map(|&v| if v.is_nan() { v } else { v * (252.0_f64).sqrt() })
        .collect();

    // Trend strength: ADX scaled to [0,1], signed by close vs SMA50.
    let mut trend_strength = vec![f64::NAN; n];
    for i in 0..n {
        if !adx_series.adx[i].is_nan() {
            let mut ts = adx_series.adx[i] / 100.0;
            if !sma_50[i].is_nan() && closes[i] < sma_50[i] {
                ts = -ts;
            }
            trend_strength[i] = ts;
        }
    }

    // Momentum
    let momentum = |lag: usize| -> Vec<f64> {
        let mut out = vec![f64::NAN; n];
        for i in lag..n {
            if closes[i - lag] != 0.0 {
                out[i] = closes[i] / closes[i - lag] - 1.0;
            }
        }
        out
    };
    let momentum_5 = momentum(5);
    let momentum_10 = momentum(10);
    let momentum_20 = momentum(20);

    // Volume SMA and ratio
    let volume_sma = ema::sma(&volumes, 20);
    let mut volume_ratio = vec![f64::NAN; n];
    for i in 0..n {
        if !volume_sma[i].is_nan() && volume_sma[i] != 0.0 {
            volume_ratio[i] = volumes[i] / volume_sma[i];
        }
    }

    // Gap vs previous close
    let mut gap = vec![f64::NAN; n];
    for i in 1..n {
        if closes[i - 1] != 0.0 {
            gap[i] = (opens[i] - closes[i - 1]) / closes[i - 1];
        }
    }

    let named: Vec<(&str, Vec<f64>)> = vec![
        ("open", opens),
        ("high", highs),
        ("low", lows),
        ("close", closes),
        ("volume", volumes),
        ("returns", returns),
        ("log_returns", log_returns),
        ("sma_20", sma_20),
        ("sma_50", sma_50),
        ("sma_200", sma_200),
        ("ema_12", ema_12),
        ("ema_26", ema_26),
        ("rsi", rsi_series),
        ("rsi_signal", rsi_signal),
        ("macd", macd_line),
        ("macd_signal", macd_sig),
        ("macd_hist", macd_hist),
        ("bb_upper", bb.upper),
        ("bb_middle", bb.middle),
        ("bb_lower", bb.lower),
        ("bb_width", bb.width),
        ("bb_pct", bb.pct),
        ("atr", atr_series),
        ("atr_pct", atr_pct),
        ("obv", obv_series),
        ("obv_ema", obv_ema),
        ("adx", adx_series.adx),
        ("plus_di", adx_series.plus_di),
        ("minus_di", adx_series.minus_di),
        ("stoch_k", stoch_k),
        ("stoch_d", stoch_d),
        ("cci", cci_series),
        ("mfi", mfi_series),
        ("volatility", volatility),
        ("trend_strength", trend_strength),
        ("momentum_5", momentum_5),
        ("momentum_10", momentum_10),
        ("momentum_20", momentum_20),
        ("volume_sma", volume_sma),
        ("volume_ratio", volume_ratio),
        ("gap", gap),
    ];

    let columns: Vec<String> = named.iter().map(|(n, _)| n.to_string()).collect();
    let mut data = Array2::zeros((n, named.len()));
    for (j, (_, series)) in named.iter().enumerate() {
        for (i, &v) in series.iter().enumerate() {
            data[[i, j]] = v;
        }
    }

    fill_nans(&mut data);

    Ok(FeatureFrame {
        columns,
        data,
        bars: bars.to_vec(),
    })
}

/// Sort bars by timestamp, drop non-finite rows, and compute the frame.
pub fn prepare_for_training(bars: &[Bar]) -> Result<FeatureFrame, IndicatorError> {
    let mut clean: Vec<Bar> = bars
        .iter()
        .filter(|b| {
            b.open.is_finite() && b.high.is_finite() && b.low.is_finite() && b.close.is_finite()
        })
        .copied()
        .collect();
    if clean.is_empty() {
        return Err(IndicatorError::EmptyInput);
    }
    clean.sort_by_key(|b| b.timestamp);
    calculate_indicators(&clean)
}

/// Backward-fill, then forward-fill, then zero-fill each column in place.
fn fill_nans(data: &mut Array2<f64>) {
    for mut col in data.axis_iter_mut(Axis(1)) {
        let n = col.len();
        // Backward fill: propagate the next valid value into leading NaNs.
        let mut next_valid = f64::NAN;
        for i in (0..n).rev() {
            if col[i].is_nan() {
                col[i] = next_valid;
            } else {
                next_valid = col[i];
            }
        }
        // Forward fill trailing NaNs.
        let mut prev_valid = f64::NAN;
        for i in 0..n {
            if col[i].is_nan() {
                col[i] = prev_valid;
            } else {
                prev_valid = col[i];
            }
        }
        // Zero-fill anything still NaN (fully empty column).
        for i in 0..n {
            if col[i].is_nan() {
                col[i] = 0.0;
            }
        }
    }
}

/// Apply `f` to the non-NaN tail of `base` and write the result back into
/// the aligned positions; positions before the tail keep `fallback`.
fn realign_tail(
    base: &[f64],
    f: &dyn Fn(&[f64]) -> Vec<f64>,
    fallback: Vec<f64>,
) -> Vec<f64> {
    let start = match base.iter().position(|v| !v.is_nan()) {
        Some(s) => s,
        None => return fallback,
    };
    let tail: Vec<f64> = base[start..].to_vec();
    let computed = f(&tail);
    let mut out = fallback;
    for (j, &v) in computed.iter().enumerate() {
        out[start + j] = v;
    }
    out
}
