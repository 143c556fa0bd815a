// =============================================================================
// Technical Indicators — feature pipeline for the trading environment
// =============================================================================
//
// Every indicator function returns a series ALIGNED to its input: one value
// per input row, with `f64::NAN` in the warm-up slots. The frame assembly in
// `frame.rs` applies the backward/forward/zero fill policy once, at the end.
// =============================================================================

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod frame;
pub mod macd;
pub mod oscillators;
pub mod rsi;
pub mod volume;

pub use frame::{calculate_indicators, prepare_for_training, FeatureFrame, IndicatorError};
