// =============================================================================
// Signal Aggregation — four predictive sources fused into one score
// =============================================================================
//
// Sources, each producing a score ∈ [−1, 1] and a confidence ∈ [0, 1]:
//   ML        — price forecast service over the last 100 bars
//   RL        — in-process PPO policy via the trainer
//   Sentiment — backend news-sentiment endpoint
//   Technical — local RSI / MACD / moving-average scoring
//
// A source that fails or lacks data contributes a zero score with zero
// confidence; the loop continues. The weighted score uses the trader's
// configured weights verbatim (no normalisation).
// =============================================================================

pub mod technical;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::agent_config::TraderConfig;
use crate::backend::{BackendClient, MarketData};
use crate::indicators::prepare_for_training;
use crate::trainer::AgentTrainer;
use crate::types::{Agreement, SignalStrength};

/// Scores below this magnitude count as neutral for agreement purposes.
const NEUTRAL_BAND: f64 = 0.1;

/// Output of one signal source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSignal {
    pub score: f64,
    pub confidence: f64,
    pub details: serde_json::Value,
}

impl SourceSignal {
    /// Zero-score, zero-confidence marker for a source that could not
    /// produce a verdict.
    pub fn unavailable(reason: &str) -> Self {
        Self {
            score: 0.0,
            confidence: 0.0,
            details: json!({ "error": reason }),
        }
    }
}

/// The closed set of signal sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Ml,
    Rl,
    Sentiment,
    Technical,
}

impl SignalSource {
    pub const ALL: [SignalSource; 4] = [
        SignalSource::Ml,
        SignalSource::Rl,
        SignalSource::Sentiment,
        SignalSource::Technical,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ml => "ml",
            Self::Rl => "rl",
            Self::Sentiment => "sentiment",
            Self::Technical => "technical",
        }
    }
}

/// Result of fusing all four sources for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedSignal {
    pub weighted_score: f64,
    pub confidence: f64,
    pub agreement: Agreement,
    pub ml_score: f64,
    pub rl_score: f64,
    pub sentiment_score: f64,
    pub technical_score: f64,
    pub ml_details: serde_json::Value,
    pub rl_details: serde_json::Value,
    pub sentiment_details: serde_json::Value,
    pub technical_details: serde_json::Value,
    pub market_context: serde_json::Value,
}

/// Fuses signals from the four sources for one trader.
pub struct SignalAggregator {
    backend: Arc<BackendClient>,
    trainer: Arc<AgentTrainer>,
    config: TraderConfig,
}

impl SignalAggregator {
    pub fn new(
        backend: Arc<BackendClient>,
        trainer: Arc<AgentTrainer>,
        config: TraderConfig,
    ) -> Self {
        Self {
            backend,
            trainer,
            config,
        }
    }

    /// Evaluate all sources and fuse them.
    pub async fn aggregate(&self, symbol: &str, market: &MarketData) -> AggregatedSignal {
        let mut signals = Vec::with_capacity(SignalSource::ALL.len());
        for source in SignalSource::ALL {
            signals.push(self.evaluate(source, symbol, market).await);
        }
        let [ml, rl, sentiment, technical]: [SourceSignal; 4] =
            signals.try_into().expect("four sources");

        let weighted_score = ml.score * self.config.ml_weight
            + rl.score * self.config.rl_weight
            + sentiment.score * self.config.sentiment_weight
            + technical.score * self.config.technical_weight;

        let scores = [ml.score, rl.score, sentiment.score, technical.score];
        let agreement = calculate_agreement(&scores);

        let confidences = [
            ml.confidence,
            rl.confidence,
            sentiment.confidence,
            technical.confidence,
        ];
        let avg_confidence = confidences.iter().sum::<f64>() / confidences.len() as f64;
        let confidence = (avg_confidence * agreement.confidence_multiplier()).min(1.0);

        debug!(
            symbol,
            weighted_score,
            confidence,
            agreement = %agreement,
            "signals aggregated"
        );

        AggregatedSignal {
            weighted_score,
            confidence,
            agreement,
            ml_score: ml.score,
            rl_score: rl.score,
            sentiment_score: sentiment.score,
            technical_score: technical.score,
            ml_details: ml.details,
            rl_details: rl.details,
            sentiment_details: sentiment.details,
            technical_details: technical.details,
            market_context: json!({
                "symbol": symbol,
                "current_price": market.current_price,
                "volume": market.volume,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        }
    }

    /// Evaluate one source; failures degrade to an unavailable signal.
    pub async fn evaluate(
        &self,
        source: SignalSource,
        symbol: &str,
        market: &MarketData,
    ) -> SourceSignal {
        match source {
            SignalSource::Ml => self.ml_signal(symbol, market).await,
            SignalSource::Rl => self.rl_signal(market),
            SignalSource::Sentiment => self.sentiment_signal(symbol).await,
            SignalSource::Technical => technical::technical_signal(&market.bars),
        }
    }

    // -------------------------------------------------------------------------
    // ML
    // -------------------------------------------------------------------------

    async fn ml_signal(&self, symbol: &str, market: &MarketData) -> SourceSignal {
        if market.bars.len() < 60 {
            return SourceSignal::unavailable("insufficient data (need 60+ points)");
        }
        let current_price = market.current_price;
        match self.backend.ml_predict(symbol, &market.bars).await {
            Ok(prediction) => {
                if current_price <= 0.0 {
                    return SourceSignal::unavailable("no current price");
                }
                let predicted_change = (prediction.prediction - current_price) / current_price;
                // ±10% predicted move saturates the score.
                let score = (predicted_change / 0.10).clamp(-1.0, 1.0);
                SourceSignal {
                    score,
                    confidence: prediction.confidence,
                    details: json!({
                        "prediction": prediction.prediction,
                        "current_price": current_price,
                        "predicted_change": predicted_change,
                        "model": prediction.model.unwrap_or_else(|| "lstm".to_string()),
                    }),
                }
            }
            Err(e) => {
                debug!(symbol, error = %e, "ml signal unavailable");
                SourceSignal::unavailable(&e.to_string())
            }
        }
    }

    // -------------------------------------------------------------------------
    // RL
    // -------------------------------------------------------------------------

    fn rl_signal(&self, market: &MarketData) -> SourceSignal {
        let agent_name = match &self.config.rl_agent_name {
            Some(name) => name,
            None => return SourceSignal::unavailable("no RL agent configured"),
        };
        if !self.trainer.registry().is_trained(agent_name) {
            return SourceSignal::unavailable("agent not found or not trained");
        }
        if market.bars.len() < 60 {
            return SourceSignal::unavailable("insufficient data (need 60+ points)");
        }

        let frame = match prepare_for_training(&market.bars) {
            Ok(frame) => frame,
            Err(e) => return SourceSignal::unavailable(&e.to_string()),
        };
        match self.trainer.get_trading_signal(agent_name, &frame) {
            Ok(signal) => {
                let base = match signal.strength {
                    SignalStrength::Weak => 0.5,
                    SignalStrength::Moderate => 0.75,
                    SignalStrength::Strong => 1.0,
                    SignalStrength::Neutral => 0.0,
                };
                let score = match signal.signal {
                    "buy" => base,
                    "sell" => -base,
                    _ => 0.0,
                };
                SourceSignal {
                    score,
                    confidence: signal.confidence,
                    details: json!({
                        "signal": signal.signal,
                        "strength": signal.strength,
                        "action": signal.action,
                        "agent_name": agent_name,
                        "action_probs": signal.action_probabilities,
                    }),
                }
            }
            Err(e) => {
                debug!(agent = %agent_name, error = %e, "rl signal unavailable");
                SourceSignal::unavailable(&e.to_string())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Sentiment
    // -------------------------------------------------------------------------

    async fn sentiment_signal(&self, symbol: &str) -> SourceSignal {
        match self.backend.fetch_sentiment(symbol).await {
            Ok(resp) => {
                let score = match resp.sentiment.as_str() {
                    "positive" => resp.score.abs(),
                    "negative" => -resp.score.abs(),
                    _ => 0.0,
                };
                SourceSignal {
                    score,
                    confidence: resp.confidence,
                    details: json!({
                        "sentiment": resp.sentiment,
                        "sentiment_score": resp.score,
                        "news_count": resp.news_count,
                        "sources": resp.sources,
                    }),
                }
            }
            Err(e) => {
                debug!(symbol, error = %e, "sentiment signal unavailable");
                SourceSignal::unavailable(&e.to_string())
            }
        }
    }
}

/// Agreement level over the non-neutral (|score| > 0.1) sources.
pub fn calculate_agreement(scores: &[f64]) -> Agreement {
    let non_neutral: Vec<f64> = scores
        .iter()
        .copied()
        .filter(|s| s.abs() > NEUTRAL_BAND)
        .collect();
    if non_neutral.len() < 2 {
        return Agreement::Weak;
    }

    let positive = non_neutral.iter().filter(|&&s| s > 0.0).count();
    let negative = non_neutral.iter().filter(|&&s| s < 0.0).count();
    let ratio = positive.max(negative) as f64 / non_neutral.len() as f64;

    // Std over ALL scores, neutral included.
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let std =
        (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64).sqrt();

    if ratio >= 0.75 && std < 0.3 {
        Agreement::Strong
    } else if ratio >= 0.6 && std < 0.5 {
        Agreement::Moderate
    } else if ratio >= 0.5 {
        Agreement::Weak
    } else {
        Agreement::Mixed
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_all_aligned_low_spread_is_strong() {
        let scores = [0.4, 0.5, 0.45, 0.5];
        assert_eq!(calculate_agreement(&scores), Agreement::Strong);
    }

    #[test]
    fn agreement_split_directions_is_weak_at_best() {
        // A perfect 2-2 split still yields a 0.5 majority ratio, landing in
        // the weak bucket.
        let scores = [0.8, -0.8, 0.7, -0.7];
        assert_eq!(calculate_agreement(&scores), Agreement::Weak);
    }

    #[test]
    fn agreement_mostly_neutral_is_weak() {
        // Only one non-neutral source.
        let scores = [0.5, 0.0, 0.05, -0.02];
        assert_eq!(calculate_agreement(&scores), Agreement::Weak);
    }

    #[test]
    fn agreement_majority_with_spread_is_moderate() {
        // 3 of 4 point up but the spread blocks "strong".
        let scores = [0.9, 0.2, 0.65, -0.4];
        assert_eq!(calculate_agreement(&scores), Agreement::Moderate);
    }

    #[test]
    fn agreement_boundary_uses_strict_std_threshold() {
        // Perfect direction agreement but high magnitude spread: the std
        // gate (< 0.3) fails, falling through to moderate.
        let scores = [1.0, 0.15, 1.0, 0.15];
        let agreement = calculate_agreement(&scores);
        assert_ne!(agreement, Agreement::Strong);
    }

    #[test]
    fn unavailable_signal_is_neutral() {
        let s = SourceSignal::unavailable("backend down");
        assert_eq!(s.score, 0.0);
        assert_eq!(s.confidence, 0.0);
        assert_eq!(s.details["error"], "backend down");
    }

    #[test]
    fn source_names_are_stable() {
        let names: Vec<&str> = SignalSource::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["ml", "rl", "sentiment", "technical"]);
    }
}
