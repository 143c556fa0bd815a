// =============================================================================
// Policy layer — networks, PPO, normalisation and schedules
// =============================================================================

pub mod extractor;
pub mod normalize;
pub mod ppo;
pub mod schedule;

pub use extractor::{TransformerExtractor, TransformerShape, N_REGIMES};
pub use normalize::ObsNormalizer;
pub use ppo::{PolicyArch, Ppo, PpoParams, PpoPolicy, RolloutStats};
pub use schedule::cosine_lr_schedule;
