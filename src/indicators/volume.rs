// =============================================================================
// Volume indicators — OBV and volume ratios
// =============================================================================

/// On-Balance Volume: running sum of volume signed by the close-to-close
/// direction. Starts at 0 for the first bar.
pub fn obv(closes: &[f64], volumes: &[f64]) -> Vec<f64> {
    let n = closes.len().min(volumes.len());
    let mut out = vec![0.0; n];
    for i in 1..n {
        let delta = if closes[i] > closes[i - 1] {
            volumes[i]
        } else if closes[i] < closes[i - 1] {
            -volumes[i]
        } else {
            0.0
        };
        out[i] = out[i - 1] + delta;
    }
    out
}
