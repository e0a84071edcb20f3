// Rate governance for the stream generator
//
// Fixed mode paces every packet at the target byte rate. Floating mode keeps
// an instantaneous target between a minimum and maximum that deliberately
// wanders: sine sweeps, boundary jumps, linear sweeps and an extreme-biased
// random walk, with forced dwells and snaps at the exact boundaries.

use super::sampling::{gauss, uniform};
use super::ObfuscationError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::f64::consts::PI;
use std::fmt;
use tracing::debug;

/// Minimum spacing between floating-rate updates, seconds
pub const UPDATE_GRANULARITY: f64 = 0.05;
const MIN_PACING_DELAY: f64 = 0.00001;
const MAX_PACING_DELAY: f64 = 0.1;

/// Bytes per second for a rate in Mbps (1 Mbps = 1024 * 1024 bit/s)
pub fn mbps_to_bytes_per_sec(mbps: f64) -> f64 {
    mbps * 1024.0 * 1024.0 / 8.0
}

/// Delay that spends `packet_bytes` at `mbps`
///
/// A small burst allowance (x0.9 at 5 Mbps and above, x0.95 at 2 Mbps and
/// above) absorbs scheduler overshoot.
pub fn pacing_delay(packet_bytes: usize, mbps: f64) -> f64 {
    let bytes_per_sec = mbps_to_bytes_per_sec(mbps);
    if !(bytes_per_sec > 0.0) || packet_bytes == 0 {
        return 0.001;
    }
    let mut delay = packet_bytes as f64 / bytes_per_sec;
    if mbps >= 5.0 {
        delay *= 0.9;
    } else if mbps >= 2.0 {
        delay *= 0.95;
    }
    delay.clamp(MIN_PACING_DELAY, MAX_PACING_DELAY)
}

/// Fluctuation shape of a floating rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FluctuationPattern {
    FullSine,
    BoundaryJumps,
    Sweep,
    AggressiveRandom,
}

impl FluctuationPattern {
    pub const ALL: [FluctuationPattern; 4] = [
        FluctuationPattern::FullSine,
        FluctuationPattern::BoundaryJumps,
        FluctuationPattern::Sweep,
        FluctuationPattern::AggressiveRandom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FluctuationPattern::FullSine => "full_sine",
            FluctuationPattern::BoundaryJumps => "boundary_jumps",
            FluctuationPattern::Sweep => "sweep",
            FluctuationPattern::AggressiveRandom => "aggressive_random",
        }
    }
}

impl fmt::Display for FluctuationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-stationary rate target clamped to `[min_mbps, max_mbps]`
#[derive(Debug, Clone)]
pub struct FloatingRate {
    min_mbps: f64,
    max_mbps: f64,
    current_mbps: f64,
    pattern: FluctuationPattern,
    phase: f64,
    /// Remaining seconds pinned at a boundary
    dwell: Option<f64>,
    last_update: f64,
    last_switch: f64,
    switch_interval: f64,
    rng: StdRng,
}

impl FloatingRate {
    pub fn new(min_mbps: f64, max_mbps: f64) -> Result<Self, ObfuscationError> {
        Self::with_rng(min_mbps, max_mbps, StdRng::from_entropy())
    }

    /// # Arguments
    ///
    /// * `min_mbps` - Lower bound, must be positive
    /// * `max_mbps` - Upper bound, must not be below `min_mbps`
    /// * `rng` - Source of all fluctuation randomness
    pub fn with_rng(min_mbps: f64, max_mbps: f64, mut rng: StdRng) -> Result<Self, ObfuscationError> {
        if !(min_mbps > 0.0) || !(max_mbps >= min_mbps) || !max_mbps.is_finite() {
            return Err(ObfuscationError::InvalidRateRange {
                min: min_mbps,
                max: max_mbps,
            });
        }
        let pattern = FluctuationPattern::ALL[rng.gen_range(0..FluctuationPattern::ALL.len())];
        Ok(Self {
            min_mbps,
            max_mbps,
            current_mbps: uniform(&mut rng, min_mbps, max_mbps),
            pattern,
            phase: uniform(&mut rng, 0.0, 2.0 * PI),
            dwell: None,
            last_update: 0.0,
            last_switch: 0.0,
            switch_interval: uniform(&mut rng, 8.0, 20.0),
            rng,
        })
    }

    pub fn current_mbps(&self) -> f64 {
        self.current_mbps
    }

    pub fn pattern(&self) -> FluctuationPattern {
        self.pattern
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min_mbps, self.max_mbps)
    }

    pub fn is_dwelling(&self) -> bool {
        self.dwell.is_some()
    }

    fn boundary(&mut self) -> f64 {
        if self.rng.gen_bool(0.5) {
            self.min_mbps
        } else {
            self.max_mbps
        }
    }

    fn switch_pattern(&mut self, now: f64) {
        self.pattern = FluctuationPattern::ALL[self.rng.gen_range(0..FluctuationPattern::ALL.len())];
        self.switch_interval = uniform(&mut self.rng, 8.0, 20.0);
        self.last_switch = now;
        self.phase = 0.0;

        if self.rng.gen_bool(0.6) {
            self.current_mbps = self.boundary();
            self.dwell = Some(uniform(&mut self.rng, 2.0, 5.0));
        }
        debug!(
            pattern = %self.pattern,
            interval = self.switch_interval,
            rate = self.current_mbps,
            "Floating rate pattern switched"
        );
    }

    /// Advance the rate to `now` seconds since the stream started
    ///
    /// Calls closer together than 50 ms leave the rate unchanged.
    pub fn tick(&mut self, now: f64) -> f64 {
        let dt = now - self.last_update;
        if dt <= UPDATE_GRANULARITY {
            return self.current_mbps;
        }

        let (min, max) = (self.min_mbps, self.max_mbps);
        let range = max - min;

        if now - self.last_switch > self.switch_interval {
            self.switch_pattern(now);
        }

        if let Some(remaining) = self.dwell {
            let remaining = remaining - dt;
            self.last_update = now;
            if remaining > 0.0 {
                self.dwell = Some(remaining);
                self.current_mbps = if self.current_mbps < (min + max) / 2.0 { min } else { max };
                return self.current_mbps;
            }
            self.dwell = None;
        }

        match self.pattern {
            FluctuationPattern::FullSine => {
                self.phase += dt * 0.5;
                let wave = self.phase.sin();
                self.current_mbps = if wave <= -0.99 {
                    min
                } else if wave >= 0.99 {
                    max
                } else {
                    min + range * (wave + 1.0) / 2.0
                };
            }
            FluctuationPattern::BoundaryJumps => {
                if self.rng.gen_bool(0.2) {
                    let roll: f64 = self.rng.gen();
                    self.current_mbps = if roll < 0.4 {
                        min
                    } else if roll < 0.8 {
                        max
                    } else {
                        min + range * self.rng.gen::<f64>()
                    };
                }
            }
            FluctuationPattern::Sweep => {
                self.phase += dt * 0.25;
                let cycle = self.phase % 2.0;
                let (from, to, progress) = if cycle < 1.0 { (min, max, cycle) } else { (max, min, cycle - 1.0) };
                self.current_mbps = if progress <= 0.02 {
                    from
                } else if progress >= 0.98 {
                    to
                } else {
                    from + (to - from) * progress
                };
            }
            FluctuationPattern::AggressiveRandom => {
                if self.rng.gen_bool(0.2) {
                    let roll: f64 = self.rng.gen();
                    self.current_mbps = if roll < 0.3 {
                        min
                    } else if roll < 0.6 {
                        max
                    } else if self.rng.gen_bool(0.5) {
                        min + range * uniform(&mut self.rng, 0.0, 0.3)
                    } else {
                        max - range * uniform(&mut self.rng, 0.0, 0.3)
                    };
                } else {
                    self.current_mbps += gauss(&mut self.rng, 0.0, range * 0.1);
                }
            }
        }

        self.current_mbps = self.current_mbps.clamp(min, max);
        if self.rng.gen_bool(0.1) {
            self.current_mbps = self.boundary();
        }
        self.last_update = now;
        self.current_mbps
    }
}

/// How the stream generator spends its byte budget
#[derive(Debug, Clone)]
pub enum RateMode {
    /// Delays come straight from the pattern steps
    Unlimited,
    Fixed { target_mbps: f64 },
    Floating(FloatingRate),
}

impl RateMode {
    pub fn fixed(target_mbps: f64) -> Result<Self, ObfuscationError> {
        if !(target_mbps > 0.0) || !target_mbps.is_finite() {
            return Err(ObfuscationError::InvalidRate(target_mbps));
        }
        Ok(RateMode::Fixed { target_mbps })
    }

    pub fn floating(min_mbps: f64, max_mbps: f64) -> Result<Self, ObfuscationError> {
        FloatingRate::new(min_mbps, max_mbps).map(RateMode::Floating)
    }

    /// Floating when both bounds are given, else fixed when a target is given
    pub fn from_options(
        target_mbps: Option<f64>,
        min_mbps: Option<f64>,
        max_mbps: Option<f64>,
    ) -> Result<Self, ObfuscationError> {
        match (min_mbps, max_mbps, target_mbps) {
            (Some(min), Some(max), _) => Self::floating(min, max),
            (_, _, Some(target)) => Self::fixed(target),
            _ => Ok(RateMode::Unlimited),
        }
    }

    /// Move floating state forward to `now` seconds since start
    pub fn tick(&mut self, now: f64) {
        if let RateMode::Floating(rate) = self {
            rate.tick(now);
        }
    }

    pub fn current_mbps(&self) -> Option<f64> {
        match self {
            RateMode::Unlimited => None,
            RateMode::Fixed { target_mbps } => Some(*target_mbps),
            RateMode::Floating(rate) => Some(rate.current_mbps()),
        }
    }

    /// Pacing delay for a packet, or `None` when unlimited
    pub fn delay_for(&self, packet_bytes: usize) -> Option<f64> {
        self.current_mbps().map(|mbps| pacing_delay(packet_bytes, mbps))
    }
}

impl fmt::Display for RateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateMode::Unlimited => write!(f, "unlimited"),
            RateMode::Fixed { target_mbps } => write!(f, "{:.2} Mbps", target_mbps),
            RateMode::Floating(rate) => write!(f, "{:.2}-{:.2} Mbps (floating)", rate.min_mbps, rate.max_mbps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_delay_math() {
        // 1 Mbps = 131072 B/s
        let d = pacing_delay(1310, 1.0);
        assert!((d - 1310.0 / 131_072.0).abs() < 1e-12);
        let d = pacing_delay(1310, 2.0);
        assert!((d - 1310.0 / 262_144.0 * 0.95).abs() < 1e-12);
        let d = pacing_delay(1310, 10.0);
        assert!((d - 1310.0 / 1_310_720.0 * 0.9).abs() < 1e-12);
        assert_eq!(pacing_delay(0, 10.0), 0.001);
        assert_eq!(pacing_delay(1_000_000, 0.01), MAX_PACING_DELAY);
        assert_eq!(pacing_delay(1, 10_000.0), MIN_PACING_DELAY);
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(FloatingRate::new(5.0, 1.0).is_err());
        assert!(FloatingRate::new(0.0, 1.0).is_err());
        assert!(FloatingRate::new(-1.0, 1.0).is_err());
        assert!(RateMode::fixed(0.0).is_err());
        assert!(FloatingRate::new(2.0, 2.0).is_ok());
    }

    #[test]
    fn test_mode_selection() {
        assert!(matches!(RateMode::from_options(Some(3.0), None, None), Ok(RateMode::Fixed { .. })));
        assert!(matches!(
            RateMode::from_options(Some(3.0), Some(1.0), Some(5.0)),
            Ok(RateMode::Floating(_))
        ));
        assert!(matches!(RateMode::from_options(None, Some(1.0), None), Ok(RateMode::Unlimited)));
        assert!(RateMode::Unlimited.delay_for(1000).is_none());
    }

    #[test]
    fn test_updates_respect_granularity() {
        let mut rate = FloatingRate::with_rng(1.0, 5.0, StdRng::seed_from_u64(1)).unwrap();
        let start = rate.current_mbps();
        assert_eq!(rate.tick(0.03), start);
        assert_eq!(rate.tick(0.05), start);
    }

    #[test]
    fn test_floating_rate_uses_full_range() {
        let mut rate = FloatingRate::with_rng(1.0, 5.0, StdRng::seed_from_u64(42)).unwrap();
        let samples: Vec<f64> = (1..=10_000).map(|i| rate.tick(i as f64 * 0.06)).collect();

        assert!(samples.iter().all(|&r| (1.0..=5.0).contains(&r)));
        assert!(samples.iter().any(|&r| (r - 1.0).abs() <= 0.01));
        assert!(samples.iter().any(|&r| (r - 5.0).abs() <= 0.05));

        let lo = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert!((hi - lo) / 4.0 >= 0.8);

        // not clustered at the mean: interior and both halves all populated
        let lower = samples.iter().filter(|&&r| r < 2.5).count();
        let upper = samples.iter().filter(|&&r| r > 3.5).count();
        let middle = samples.iter().filter(|&&r| r > 1.5 && r < 4.5).count();
        assert!(lower > 1_000 && upper > 1_000 && middle > 500);
    }

    #[test]
    fn test_patterns_rotate() {
        let mut rate = FloatingRate::with_rng(1.0, 5.0, StdRng::seed_from_u64(7)).unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 1..=20_000 {
            rate.tick(i as f64 * 0.06);
            seen.insert(rate.pattern());
        }
        assert!(seen.len() >= 3);
    }

    #[test]
    fn test_dwell_pins_boundary() {
        let mut rate = FloatingRate::with_rng(1.0, 5.0, StdRng::seed_from_u64(9)).unwrap();
        rate.current_mbps = 1.0;
        rate.dwell = Some(1.0);
        for i in 1..=10 {
            assert_eq!(rate.tick(i as f64 * 0.06), 1.0);
        }
    }
}
