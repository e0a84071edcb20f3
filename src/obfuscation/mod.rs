// Traffic shaping engine
//
// Leaf statistical engines (timing, correlation, entropy, adversarial,
// state machine) decide packet sizes, gaps and payload bytes. The composition
// layer (mimicry, obfuscator, rate, stream) turns them into an unbounded
// stream of (fragments, delay) pairs under a byte-rate budget.

pub mod adversarial;
pub mod analysis;
pub mod correlation;
pub mod entropy;
pub mod header;
pub mod mimicry;
pub mod obfuscator;
pub mod padding;
pub mod rate;
pub mod sampling;
pub mod state_machine;
pub mod stream;
pub mod timing;

pub use adversarial::MlResistantGenerator;
pub use analysis::StatisticalAnalyzer;
pub use correlation::CorrelationBreaker;
pub use entropy::{ContentType, EntropyEnhancer};
pub use header::HeaderMode;
pub use mimicry::{PatternStep, ProtocolMimicry};
pub use obfuscator::{DynamicObfuscator, ObfuscationConfig};
pub use padding::PaddingStrategy;
pub use rate::{FloatingRate, RateMode};
pub use state_machine::{ProtocolStateMachine, ProtocolType};
pub use stream::StreamGenerator;
pub use timing::AdaptiveTimingModel;

use thiserror::Error;

/// Errors raised by the shaping engine on invalid input
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObfuscationError {
    #[error("Cannot analyze an empty payload")]
    EmptyPayload,

    #[error("Entropy must be within [0, 1], got {0}")]
    InvalidEntropy(f64),

    #[error("Timing jitter must be non-negative, got {0}")]
    InvalidJitter(f64),

    #[error("Invalid floating rate range: min {min} Mbps, max {max} Mbps")]
    InvalidRateRange { min: f64, max: f64 },

    #[error("Target rate must be positive, got {0} Mbps")]
    InvalidRate(f64),

    #[error("Fixed buckets must be non-empty and ascending")]
    InvalidBuckets,
}
