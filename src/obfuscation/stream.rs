// Stream generator
//
// Pull-based producer of (fragments, delay) pairs. Walks the profile's
// pattern cyclically, generates a payload at the configured entropy level,
// obfuscates it and paces the result under the rate budget. Every cycle ends
// with a freshly shaped segment from the leaf engines.

use super::entropy::{ContentType, EntropyEnhancer};
use super::mimicry::{PatternStep, ProtocolMimicry};
use super::obfuscator::DynamicObfuscator;
use super::rate::RateMode;
use crate::profile::TrafficProfile;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::time::Instant;
use tracing::trace;

/// Payload size range used for predictable rate math
pub const MIN_STREAM_PAYLOAD: usize = 800;
pub const MAX_STREAM_PAYLOAD: usize = 1400;
/// Steps appended from the shaped session on every cycle
const SHAPED_SEGMENT: usize = 256;
/// Share of large payloads built by the entropy enhancer
const ENHANCED_PAYLOAD_SHARE: f64 = 0.1;

/// One emitted packet: fragments to send, then the delay before the next
pub type StreamItem = (Vec<Vec<u8>>, f64);

pub struct StreamGenerator {
    profile: TrafficProfile,
    base: Vec<PatternStep>,
    steps: Vec<PatternStep>,
    idx: usize,
    cycles: u64,
    rate: RateMode,
    obfuscator: DynamicObfuscator,
    mimicry: ProtocolMimicry,
    enhancer: EntropyEnhancer,
    entropy: f64,
    started: Instant,
    rng: StdRng,
}

impl StreamGenerator {
    /// # Arguments
    ///
    /// * `profile` - Traffic profile whose pattern is walked
    /// * `rate` - Fixed, floating or unlimited pacing
    /// * `obfuscator` - Applied to every generated payload
    /// * `entropy` - Payload entropy level, clamped to [0, 1]
    pub fn new(profile: TrafficProfile, rate: RateMode, obfuscator: DynamicObfuscator, entropy: f64) -> Self {
        Self::with_rng(profile, rate, obfuscator, entropy, StdRng::from_entropy())
    }

    pub fn with_rng(
        profile: TrafficProfile,
        rate: RateMode,
        obfuscator: DynamicObfuscator,
        entropy: f64,
        mut rng: StdRng,
    ) -> Self {
        let mut mimicry = ProtocolMimicry::with_rng(child_rng(&mut rng));
        let enhancer = EntropyEnhancer::with_rng(child_rng(&mut rng));
        let base = normalize(mimicry.for_profile(profile));
        let mut generator = Self {
            profile,
            base,
            steps: Vec::new(),
            idx: 0,
            cycles: 0,
            rate,
            obfuscator,
            mimicry,
            enhancer,
            entropy: entropy.clamp(0.0, 1.0),
            started: Instant::now(),
            rng,
        };
        generator.rebuild_cycle();
        generator
    }

    pub fn profile(&self) -> TrafficProfile {
        self.profile
    }

    pub fn rate(&self) -> &RateMode {
        &self.rate
    }

    pub fn current_mbps(&self) -> Option<f64> {
        self.rate.current_mbps()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn rebuild_cycle(&mut self) {
        let mut steps = self.base.clone();
        steps.extend(normalize(self.mimicry.shaped_session(self.profile, SHAPED_SEGMENT)));
        if steps.is_empty() {
            steps.push(PatternStep::new(1200, 0.001));
        }
        trace!(profile = %self.profile, steps = steps.len(), cycle = self.cycles, "Pattern cycle rebuilt");
        self.steps = steps;
        self.idx = 0;
    }

    /// Payload of `size` bytes at the configured entropy level
    fn payload(&mut self, size: usize) -> Vec<u8> {
        if size == 0 {
            return Vec::new();
        }
        if size > 1000 && self.rng.gen_bool(ENHANCED_PAYLOAD_SHARE) {
            return self
                .enhancer
                .generate_realistic_encrypted_payload(size, ContentType::Mixed, None);
        }

        if self.entropy < 0.5 {
            // mostly one repeated byte with a sprinkling of noise
            let mut data = vec![self.rng.gen::<u8>(); size];
            let noisy = (size as f64 * self.entropy) as usize;
            for _ in 0..noisy {
                let at = self.rng.gen_range(0..size);
                data[at] = self.rng.gen();
            }
            return data;
        }

        let mut data = vec![0u8; size];
        self.rng.fill_bytes(&mut data);
        data
    }

    /// Produce the next item as if `elapsed` seconds had passed since start
    pub fn next_at(&mut self, elapsed: f64) -> StreamItem {
        self.rate.tick(elapsed);

        if self.idx >= self.steps.len() {
            self.cycles += 1;
            self.rebuild_cycle();
        }
        let step = self.steps[self.idx];
        self.idx += 1;

        let payload = self.payload(step.size);
        let (fragments, _) = self.obfuscator.obfuscate(&payload, Some(self.profile), step.delay);
        let packet_bytes: usize = fragments.iter().map(Vec::len).sum();

        let delay = self.rate.delay_for(packet_bytes).unwrap_or(step.delay);
        (fragments, delay)
    }
}

impl Iterator for StreamGenerator {
    type Item = StreamItem;

    fn next(&mut self) -> Option<Self::Item> {
        let elapsed = self.started.elapsed().as_secs_f64();
        Some(self.next_at(elapsed))
    }
}

/// Clamp every step's size into the stream payload range
fn normalize(steps: Vec<PatternStep>) -> Vec<PatternStep> {
    steps
        .into_iter()
        .map(|s| PatternStep::new(s.size.clamp(MIN_STREAM_PAYLOAD, MAX_STREAM_PAYLOAD), s.delay))
        .collect()
}

fn child_rng(rng: &mut StdRng) -> StdRng {
    StdRng::from_rng(rng).unwrap_or_else(|_| StdRng::from_entropy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::analysis::StatisticalAnalyzer;
    use crate::obfuscation::header::HeaderMode;
    use crate::obfuscation::obfuscator::ObfuscationConfig;
    use crate::obfuscation::padding::PaddingStrategy;

    fn plain_obfuscator(seed: u64) -> DynamicObfuscator {
        let config = ObfuscationConfig {
            padding_strategy: PaddingStrategy::None,
            header_mode: HeaderMode::None,
            ..Default::default()
        };
        DynamicObfuscator::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn generator(profile: TrafficProfile, rate: RateMode, entropy: f64, seed: u64) -> StreamGenerator {
        StreamGenerator::with_rng(profile, rate, plain_obfuscator(seed), entropy, StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_sizes_are_normalized() {
        let mut stream = generator(TrafficProfile::Voip, RateMode::Unlimited, 1.0, 1);
        for _ in 0..500 {
            let (frags, _) = stream.next_at(0.0);
            let total: usize = frags.iter().map(Vec::len).sum();
            assert!((MIN_STREAM_PAYLOAD..=MAX_STREAM_PAYLOAD).contains(&total));
        }
    }

    #[test]
    fn test_fixed_rate_delay() {
        let mut stream = generator(TrafficProfile::File, RateMode::fixed(2.0).unwrap(), 1.0, 2);
        for _ in 0..200 {
            let (frags, delay) = stream.next_at(0.0);
            let total: usize = frags.iter().map(Vec::len).sum();
            let expected = total as f64 / (2.0 * 1024.0 * 1024.0 / 8.0) * 0.95;
            assert!((delay - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_floating_rate_stays_in_bounds() {
        let rate = RateMode::floating(1.0, 5.0).unwrap();
        let mut stream = generator(TrafficProfile::Gaming, rate, 1.0, 3);
        for i in 0..2_000 {
            let (frags, delay) = stream.next_at(i as f64 * 0.01);
            let mbps = stream.current_mbps().unwrap();
            assert!((1.0..=5.0).contains(&mbps));
            let total: usize = frags.iter().map(Vec::len).sum();
            assert!(delay >= total as f64 / (5.0 * 131_072.0) * 0.9 - 1e-12);
        }
    }

    #[test]
    fn test_cycles_restart_with_shaped_segment() {
        let mut stream = generator(TrafficProfile::Web, RateMode::Unlimited, 1.0, 4);
        let first_cycle = stream.steps.len();
        for _ in 0..first_cycle + 1 {
            stream.next_at(0.0);
        }
        assert_eq!(stream.cycles(), 1);
        assert!(stream.steps.len() >= SHAPED_SEGMENT);
    }

    #[test]
    fn test_low_entropy_payload() {
        let mut stream = generator(TrafficProfile::Video, RateMode::Unlimited, 0.1, 5);
        let payload = stream.payload(900);
        assert_eq!(payload.len(), 900);
        assert!(StatisticalAnalyzer::entropy_normalized(&payload) < 0.5);

        let mut stream = generator(TrafficProfile::Video, RateMode::Unlimited, 1.0, 6);
        let payload = stream.payload(900);
        assert!(StatisticalAnalyzer::entropy_normalized(&payload) > 0.9);
    }

    #[test]
    fn test_iterator_never_ends() {
        let stream = generator(TrafficProfile::Mixed, RateMode::fixed(10.0).unwrap(), 1.0, 7);
        assert_eq!(stream.take(5_000).count(), 5_000);
    }
}
