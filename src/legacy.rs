//! Non-advanced server path
//!
//! Rate shapes that modulate a base byte rate over time, and a generator of
//! checksummed data packets whose payload changes every ten seconds.

use crate::obfuscation::sampling::{uniform, weighted_choice};
use crate::protocol::{LegacyDataPacket, LEGACY_HEADER_LEN};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::fmt;

pub const MIN_PACKET: usize = 64;
pub const MAX_PACKET: usize = 1400;
/// Seconds a rate shape stays selected, lower and upper bound
const SWITCH_MIN_SECS: f64 = 5.0;
const SWITCH_MAX_SECS: f64 = 30.0;
/// Payload pattern changes once per window
const PAYLOAD_WINDOW_SECS: u64 = 10;

/// Shape applied to the base rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RatePattern {
    ConstantBitrate,
    Burst,
    Wave,
    RandomWalk,
    MediaLike,
}

impl RatePattern {
    pub const ALL: [RatePattern; 5] = [
        RatePattern::ConstantBitrate,
        RatePattern::Burst,
        RatePattern::Wave,
        RatePattern::RandomWalk,
        RatePattern::MediaLike,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RatePattern::ConstantBitrate => "constant_bitrate",
            RatePattern::Burst => "burst_pattern",
            RatePattern::Wave => "wave_pattern",
            RatePattern::RandomWalk => "random_walk",
            RatePattern::MediaLike => "media_like_pattern",
        }
    }
}

impl fmt::Display for RatePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rotates through [`RatePattern`]s, switching every 5 to 30 seconds
pub struct RatePatternGenerator {
    current: RatePattern,
    started_at: f64,
    duration: f64,
    /// Random-walk position, reset when the base rate changes
    walk: Option<(f64, f64)>,
    rng: StdRng,
}

impl RatePatternGenerator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(mut rng: StdRng) -> Self {
        let current = RatePattern::ALL[rng.gen_range(0..RatePattern::ALL.len())];
        let duration = uniform(&mut rng, SWITCH_MIN_SECS, SWITCH_MAX_SECS);
        Self {
            current,
            started_at: 0.0,
            duration,
            walk: None,
            rng,
        }
    }

    pub fn current(&self) -> RatePattern {
        self.current
    }

    fn switch(&mut self, now: f64) {
        self.current = RatePattern::ALL[self.rng.gen_range(0..RatePattern::ALL.len())];
        self.duration = uniform(&mut self.rng, SWITCH_MIN_SECS, SWITCH_MAX_SECS);
        self.started_at = now;
    }

    /// Current rate for `base_rate` at `now` seconds on the caller's clock
    pub fn rate_at(&mut self, base_rate: f64, now: f64) -> f64 {
        if now - self.started_at > self.duration {
            self.switch(now);
        }
        let rng = &mut self.rng;
        match self.current {
            RatePattern::ConstantBitrate => base_rate * uniform(rng, 0.95, 1.05),
            RatePattern::Burst => {
                if rng.gen_bool(0.1) {
                    base_rate * uniform(rng, 2.0, 4.0)
                } else {
                    base_rate * uniform(rng, 0.5, 0.8)
                }
            }
            RatePattern::Wave => {
                let wave = (now / 5.0).sin() * 0.5 + 1.0;
                base_rate * wave * uniform(rng, 0.9, 1.1)
            }
            RatePattern::RandomWalk => {
                let value = match self.walk {
                    Some((base, value)) if base == base_rate => value,
                    _ => base_rate,
                };
                let step = uniform(rng, -0.1, 0.1) * base_rate;
                let next = (value + step).clamp(base_rate * 0.3, base_rate * 2.0);
                self.walk = Some((base_rate, next));
                next
            }
            RatePattern::MediaLike => {
                let base = base_rate * 0.7;
                if rng.gen_bool(0.05) {
                    // key frame
                    base + base_rate * uniform(rng, 0.5, 1.5)
                } else {
                    base + uniform(rng, -0.1, 0.1) * base_rate
                }
            }
        }
    }
}

impl Default for RatePatternGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Size classes used when the caller asks for no particular size
const SIZE_CLASSES: [((usize, usize), f64); 5] = [
    ((MIN_PACKET, 200), 0.1),
    ((200, 500), 0.15),
    ((500, 1000), 0.5),
    ((1000, 1300), 0.15),
    ((1300, MAX_PACKET), 0.1),
];

/// Builds [`LegacyDataPacket`]s with a running sequence number
pub struct LegacyPacketGenerator {
    sequence: u32,
    rng: StdRng,
}

impl LegacyPacketGenerator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self { sequence: 0, rng }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Total packet size for an optional target, within [64, 1400]
    pub fn packet_size(&mut self, target: Option<usize>) -> usize {
        match target {
            Some(size) => size.clamp(MIN_PACKET, MAX_PACKET),
            None => {
                let &(lo, hi) = weighted_choice(&mut self.rng, &SIZE_CLASSES)
                    .unwrap_or(&(MIN_PACKET, MAX_PACKET));
                self.rng.gen_range(lo..=hi)
            }
        }
    }

    /// Next packet stamped with the current wall clock
    pub fn generate(&mut self, target: Option<usize>) -> LegacyDataPacket {
        self.generate_at(target, crate::protocol::now_micros())
    }

    pub fn generate_at(&mut self, target: Option<usize>, timestamp_us: u64) -> LegacyDataPacket {
        let size = self.packet_size(target);
        self.sequence = self.sequence.wrapping_add(1);

        let window = timestamp_us / 1_000_000 / PAYLOAD_WINDOW_SECS;
        let mut payload = vec![0u8; size - LEGACY_HEADER_LEN];
        StdRng::seed_from_u64(window).fill_bytes(&mut payload);

        LegacyDataPacket::new(self.sequence, timestamp_us, payload)
    }
}

impl Default for LegacyPacketGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_names() {
        assert_eq!(RatePattern::MediaLike.to_string(), "media_like_pattern");
        assert_eq!(RatePattern::ConstantBitrate.to_string(), "constant_bitrate");
    }

    #[test]
    fn test_rates_stay_within_shape_bounds() {
        let mut gen = RatePatternGenerator::with_rng(StdRng::seed_from_u64(1));
        let base = 1_000_000.0;
        for i in 0..20_000 {
            let now = i as f64 * 0.01;
            let rate = gen.rate_at(base, now);
            let (lo, hi) = match gen.current() {
                RatePattern::ConstantBitrate => (0.95, 1.05),
                RatePattern::Burst => (0.5, 4.0),
                RatePattern::Wave => (0.45, 1.65),
                RatePattern::RandomWalk => (0.3, 2.0),
                RatePattern::MediaLike => (0.6, 2.2),
            };
            assert!(rate >= base * lo - 1e-6 && rate <= base * hi + 1e-6, "{} {}", gen.current(), rate);
        }
    }

    #[test]
    fn test_patterns_switch() {
        let mut gen = RatePatternGenerator::with_rng(StdRng::seed_from_u64(2));
        let mut seen = std::collections::HashSet::new();
        for i in 0..5_000 {
            gen.rate_at(1.0, i as f64);
            seen.insert(gen.current());
        }
        assert_eq!(seen.len(), RatePattern::ALL.len());
    }

    #[test]
    fn test_packet_sizes() {
        let mut gen = LegacyPacketGenerator::with_rng(StdRng::seed_from_u64(3));
        assert_eq!(gen.packet_size(Some(10)), MIN_PACKET);
        assert_eq!(gen.packet_size(Some(5000)), MAX_PACKET);
        for _ in 0..1_000 {
            let size = gen.packet_size(None);
            assert!((MIN_PACKET..=MAX_PACKET).contains(&size));
        }
    }

    #[test]
    fn test_packets_verify_and_sequence() {
        let mut gen = LegacyPacketGenerator::with_rng(StdRng::seed_from_u64(4));
        let a = gen.generate_at(Some(1200), 5_000_000);
        let b = gen.generate_at(Some(1200), 6_000_000);
        assert_eq!((a.sequence, b.sequence), (1, 2));
        assert_eq!(a.encoded_len(), 1200);
        assert!(a.verify().is_ok());
        // same ten-second window, same payload
        assert_eq!(a.payload, b.payload);

        let c = gen.generate_at(Some(1200), 15_000_000);
        assert_ne!(a.payload, c.payload);
    }
}
