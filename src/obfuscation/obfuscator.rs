// Dynamic obfuscator
//
// Header, then padding, then MTU fragmentation, plus a delay for the batch.

use super::header::{HeaderMode, HeaderState};
use super::padding::{PaddingStrategy, DEFAULT_BUCKETS};
use super::sampling::gauss;
use super::timing::AdaptiveTimingModel;
use super::ObfuscationError;
use crate::profile::TrafficProfile;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

pub const MIN_MTU: usize = 256;
/// Ceiling on model-driven delays so throughput is preserved
const MODEL_DELAY_CAP: f64 = 0.01;
const MIN_DELAY: f64 = 0.0001;

fn default_mtu() -> usize {
    1200
}

fn default_entropy() -> f64 {
    1.0
}

fn default_timing_jitter() -> f64 {
    0.002
}

fn default_fixed_buckets() -> Vec<usize> {
    DEFAULT_BUCKETS.to_vec()
}

/// Obfuscation settings, fixed for the lifetime of a client or server run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    #[serde(default)]
    pub padding_strategy: PaddingStrategy,

    #[serde(default)]
    pub header_mode: HeaderMode,

    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Payload entropy level in [0, 1]
    #[serde(default = "default_entropy")]
    pub entropy: f64,

    /// Standard deviation of the delay jitter, seconds
    #[serde(default = "default_timing_jitter")]
    pub timing_jitter: f64,

    #[serde(default = "default_fixed_buckets")]
    pub fixed_buckets: Vec<usize>,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            padding_strategy: PaddingStrategy::default(),
            header_mode: HeaderMode::default(),
            mtu: default_mtu(),
            entropy: default_entropy(),
            timing_jitter: default_timing_jitter(),
            fixed_buckets: default_fixed_buckets(),
        }
    }
}

impl ObfuscationConfig {
    /// Normalize and check the settings
    ///
    /// The MTU is raised to at least 256 bytes; entropy, jitter and buckets
    /// are rejected when out of range.
    pub fn validated(mut self) -> Result<Self, ObfuscationError> {
        self.mtu = self.mtu.max(MIN_MTU);
        if !(0.0..=1.0).contains(&self.entropy) {
            return Err(ObfuscationError::InvalidEntropy(self.entropy));
        }
        if !(self.timing_jitter >= 0.0) {
            return Err(ObfuscationError::InvalidJitter(self.timing_jitter));
        }
        if self.fixed_buckets.is_empty() || self.fixed_buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ObfuscationError::InvalidBuckets);
        }
        Ok(self)
    }
}

/// Split `packet` into MTU-sized chunks without reassembly metadata
///
/// The MTU is floored at 256 bytes. An empty packet yields no fragments.
pub fn fragment(packet: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    packet.chunks(mtu.max(MIN_MTU)).map(<[u8]>::to_vec).collect()
}

/// Applies pseudo-header, padding, fragmentation and delay jitter
pub struct DynamicObfuscator {
    config: ObfuscationConfig,
    headers: HeaderState,
    timing_model: AdaptiveTimingModel,
    rng: StdRng,
}

impl DynamicObfuscator {
    pub fn new(config: ObfuscationConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(mut config: ObfuscationConfig, mut rng: StdRng) -> Self {
        config.mtu = config.mtu.max(MIN_MTU);
        config.timing_jitter = config.timing_jitter.max(0.0);
        if config.fixed_buckets.is_empty() {
            config.fixed_buckets = default_fixed_buckets();
        }
        let headers = HeaderState::new(&mut rng);
        let model_rng = StdRng::from_rng(&mut rng).unwrap_or_else(|_| StdRng::from_entropy());
        let timing_model = AdaptiveTimingModel::with_rng(0.02, 0.3, model_rng);
        Self {
            config,
            headers,
            timing_model,
            rng,
        }
    }

    pub fn config(&self) -> &ObfuscationConfig {
        &self.config
    }

    /// Header and padding without fragmentation
    pub fn shape(&mut self, payload: &[u8], profile: Option<TrafficProfile>) -> Vec<u8> {
        let mut packet = self
            .headers
            .apply(&mut self.rng, self.config.header_mode, payload, profile);
        self.config
            .padding_strategy
            .apply(&mut self.rng, &mut packet, &self.config.fixed_buckets, self.config.mtu);
        packet
    }

    /// Obfuscate one payload into `(fragments, delay_seconds)`
    ///
    /// # Arguments
    ///
    /// * `payload` - Raw bytes to disguise
    /// * `profile` - Selects the RTP payload type when the header is RTP-like
    /// * `base_delay` - Target delay; zero defers to the timing model
    pub fn obfuscate(
        &mut self,
        payload: &[u8],
        profile: Option<TrafficProfile>,
        base_delay: f64,
    ) -> (Vec<Vec<u8>>, f64) {
        let packet = self.shape(payload, profile);
        let fragments = fragment(&packet, self.config.mtu);

        let delay = if base_delay > 0.0 {
            let bound = base_delay * 0.1;
            let jitter = gauss(&mut self.rng, 0.0, self.config.timing_jitter.min(bound)).clamp(-bound, bound);
            (base_delay + jitter).max(MIN_DELAY)
        } else {
            self.timing_model.get_delay(payload.len(), 0.5).min(MODEL_DELAY_CAP)
        };

        (fragments, delay)
    }
}
