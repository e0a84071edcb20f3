// Correlation breaker
//
// Packet sizes follow per-profile Markov chains over small/medium/large
// buckets and are blended with recent history, so consecutive sizes are
// correlated the way real traffic is instead of being i.i.d.

use super::sampling::{uniform, weighted_index};
use crate::profile::TrafficProfile;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;

/// Length of the size and interval histories
const HISTORY_LEN: usize = 20;
/// Weight of the history average in a correlated size
const AUTOCORR_COEFFICIENT: f64 = 0.3;
/// Burst sizes never exceed this
const BURST_CAP: usize = 1400;
const MIN_INTERVAL: f64 = 0.0001;

/// Markov bucket for packet sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeBucket {
    Small,
    Medium,
    Large,
}

impl SizeBucket {
    pub const ALL: [SizeBucket; 3] = [SizeBucket::Small, SizeBucket::Medium, SizeBucket::Large];

    fn index(self) -> usize {
        match self {
            SizeBucket::Small => 0,
            SizeBucket::Medium => 1,
            SizeBucket::Large => 2,
        }
    }
}

/// Row-stochastic transition table indexed by [from][to]
pub type TransitionTable = [[f64; 3]; 3];

/// Transition table for a profile; `Mixed` uses the generic chain.
pub fn transition_table(profile: TrafficProfile) -> TransitionTable {
    match profile {
        TrafficProfile::Web => [[0.40, 0.40, 0.20], [0.30, 0.40, 0.30], [0.35, 0.35, 0.30]],
        TrafficProfile::Video => [[0.10, 0.20, 0.70], [0.10, 0.30, 0.60], [0.05, 0.15, 0.80]],
        TrafficProfile::Voip => [[0.80, 0.15, 0.05], [0.70, 0.25, 0.05], [0.60, 0.30, 0.10]],
        TrafficProfile::File => [[0.10, 0.10, 0.80], [0.10, 0.20, 0.70], [0.05, 0.10, 0.85]],
        TrafficProfile::Gaming => [[0.60, 0.30, 0.10], [0.45, 0.40, 0.15], [0.40, 0.40, 0.20]],
        TrafficProfile::Mixed => [[0.35, 0.45, 0.20], [0.25, 0.50, 0.25], [0.20, 0.45, 0.35]],
    }
}

fn classify(size: usize, profile: TrafficProfile) -> SizeBucket {
    let (small, medium) = match profile {
        TrafficProfile::Voip => (80, 160),
        TrafficProfile::Video => (1000, 1300),
        TrafficProfile::Gaming => (100, 300),
        _ => (400, 1000),
    };
    if size < small {
        SizeBucket::Small
    } else if size < medium {
        SizeBucket::Medium
    } else {
        SizeBucket::Large
    }
}

/// Inclusive byte range for a bucket
pub fn size_range(bucket: SizeBucket, profile: TrafficProfile) -> (usize, usize) {
    let ranges = match profile {
        TrafficProfile::Voip => [(20, 80), (80, 160), (160, 320)],
        TrafficProfile::Video => [(800, 1000), (1000, 1300), (1300, 1400)],
        TrafficProfile::Gaming => [(40, 100), (100, 300), (300, 600)],
        TrafficProfile::File => [(500, 800), (800, 1200), (1200, 1400)],
        TrafficProfile::Web | TrafficProfile::Mixed => [(64, 400), (400, 1000), (1000, 1400)],
    };
    ranges[bucket.index()]
}

fn burst_probability(profile: TrafficProfile) -> f64 {
    match profile {
        TrafficProfile::Web => 0.15,
        TrafficProfile::Video => 0.05,
        TrafficProfile::Voip => 0.02,
        TrafficProfile::File => 0.20,
        TrafficProfile::Gaming => 0.10,
        TrafficProfile::Mixed => 0.08,
    }
}

fn burst_length(profile: TrafficProfile) -> (u32, u32) {
    match profile {
        TrafficProfile::Web => (5, 20),
        TrafficProfile::Video => (10, 30),
        TrafficProfile::Voip => (2, 5),
        TrafficProfile::File => (20, 100),
        TrafficProfile::Gaming => (3, 10),
        TrafficProfile::Mixed => (5, 25),
    }
}

fn nearest(candidates: &[f64], value: f64) -> f64 {
    candidates
        .iter()
        .copied()
        .min_by(|a, b| (a - value).abs().total_cmp(&(b - value).abs()))
        .unwrap_or(value)
}

/// Snapshot returned by [`CorrelationBreaker::statistics`]
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationStatistics {
    pub current_state: SizeBucket,
    pub burst_mode: bool,
    pub burst_remaining: u32,
    pub total_packets: u64,
    pub small_percentage: f64,
    pub medium_percentage: f64,
    pub large_percentage: f64,
    pub avg_recent_size: Option<f64>,
    pub avg_recent_interval: Option<f64>,
}

/// Markov-chain size and interval shaper
#[derive(Debug, Clone)]
pub struct CorrelationBreaker {
    current_state: SizeBucket,
    last_size: usize,
    size_history: VecDeque<usize>,
    interval_history: VecDeque<f64>,
    burst_mode: bool,
    burst_remaining: u32,
    state_counts: [u64; 3],
    total_packets: u64,
    rng: StdRng,
}

impl CorrelationBreaker {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            current_state: SizeBucket::Medium,
            last_size: 512,
            size_history: VecDeque::with_capacity(HISTORY_LEN),
            interval_history: VecDeque::with_capacity(HISTORY_LEN),
            burst_mode: false,
            burst_remaining: 0,
            state_counts: [0; 3],
            total_packets: 0,
            rng,
        }
    }

    /// Next packet size, correlated with the recent ones
    ///
    /// # Arguments
    ///
    /// * `base_size` - Suggested size; only its bucket matters
    /// * `profile` - Selects thresholds, Markov chain and ranges
    pub fn get_correlated_size(&mut self, base_size: usize, profile: TrafficProfile) -> usize {
        self.total_packets += 1;

        let state = classify(base_size, profile);
        let row = transition_table(profile)[state.index()];
        let next = SizeBucket::ALL[weighted_index(&mut self.rng, &row)];

        let mut size = self.autocorrelate(size_range(next, profile));

        if self.burst_mode {
            size = self.apply_burst(size);
        }
        if !self.burst_mode && self.rng.gen_bool(burst_probability(profile)) {
            let (lo, hi) = burst_length(profile);
            self.burst_mode = true;
            self.burst_remaining = self.rng.gen_range(lo..=hi);
        }

        push_bounded(&mut self.size_history, size);
        self.last_size = size;
        self.current_state = next;
        self.state_counts[next.index()] += 1;
        size
    }

    /// Uniform draw in range blended with an exponentially weighted history average
    fn autocorrelate(&mut self, (min, max): (usize, usize)) -> usize {
        let fresh = self.rng.gen_range(min..=max);
        if self.size_history.is_empty() {
            return fresh;
        }

        // newest entry weighs 1, each older one half as much
        let n = self.size_history.len();
        let (mut weighted, mut total) = (0.0, 0.0);
        for (i, size) in self.size_history.iter().enumerate() {
            let w = 0.5f64.powi((n - 1 - i) as i32);
            weighted += w * *size as f64;
            total += w;
        }
        let avg = weighted / total;

        let blended = (avg * AUTOCORR_COEFFICIENT + fresh as f64 * (1.0 - AUTOCORR_COEFFICIENT)) as i64
            + self.rng.gen_range(-20..=20);
        blended.clamp(min as i64, max as i64) as usize
    }

    fn apply_burst(&mut self, size: usize) -> usize {
        if self.burst_remaining == 0 {
            self.burst_mode = false;
            return size;
        }
        let factor = uniform(&mut self.rng, 1.2, 1.8);
        self.burst_remaining -= 1;
        if self.burst_remaining == 0 {
            self.burst_mode = false;
        }
        ((size as f64 * factor) as usize).min(BURST_CAP)
    }

    /// Next inter-packet interval in seconds
    pub fn get_correlated_interval(&mut self, base_interval: f64, profile: TrafficProfile) -> f64 {
        let mut interval = match profile {
            TrafficProfile::Voip => base_interval * uniform(&mut self.rng, 0.98, 1.02),
            TrafficProfile::Video => {
                nearest(&[0.008, 0.016, 0.033, 0.040], base_interval) * uniform(&mut self.rng, 0.95, 1.05)
            }
            TrafficProfile::Gaming => {
                nearest(&[0.016, 0.033, 0.050], base_interval) * uniform(&mut self.rng, 0.90, 1.10)
            }
            _ => {
                if self.interval_history.is_empty() {
                    base_interval * uniform(&mut self.rng, 0.8, 1.2)
                } else {
                    let avg = self.interval_history.iter().sum::<f64>() / self.interval_history.len() as f64;
                    (avg * 0.4 + base_interval * 0.6) * uniform(&mut self.rng, 0.85, 1.15)
                }
            }
        };

        if self.rng.gen_bool(0.02) {
            interval *= if self.rng.gen_bool(0.5) {
                uniform(&mut self.rng, 0.1, 0.5)
            } else {
                uniform(&mut self.rng, 2.0, 5.0)
            };
        }

        push_bounded(&mut self.interval_history, interval);
        interval.max(MIN_INTERVAL)
    }

    /// Couple intervals to sizes across parallel sequences
    ///
    /// Sequences of different length are returned untouched.
    pub fn add_cross_correlation(&mut self, sizes: Vec<usize>, intervals: Vec<f64>) -> (Vec<usize>, Vec<f64>) {
        if sizes.len() != intervals.len() {
            return (sizes, intervals);
        }

        let mut shaped = Vec::with_capacity(intervals.len());
        for (i, (&size, &interval)) in sizes.iter().zip(intervals.iter()).enumerate() {
            let mut interval = interval;
            if size > 1200 {
                interval *= uniform(&mut self.rng, 1.1, 1.3);
            } else if size < 100 {
                interval *= uniform(&mut self.rng, 0.8, 0.95);
            }
            if i > 0 && sizes[i - 1] < 100 && size < 100 {
                interval *= 0.5;
            }
            shaped.push(interval);
        }
        (sizes, shaped)
    }

    pub fn statistics(&self) -> CorrelationStatistics {
        let pct = |count: u64| {
            if self.total_packets == 0 {
                0.0
            } else {
                count as f64 / self.total_packets as f64 * 100.0
            }
        };
        let avg_size = (!self.size_history.is_empty())
            .then(|| self.size_history.iter().sum::<usize>() as f64 / self.size_history.len() as f64);
        let avg_interval = (!self.interval_history.is_empty())
            .then(|| self.interval_history.iter().sum::<f64>() / self.interval_history.len() as f64);

        CorrelationStatistics {
            current_state: self.current_state,
            burst_mode: self.burst_mode,
            burst_remaining: self.burst_remaining,
            total_packets: self.total_packets,
            small_percentage: pct(self.state_counts[0]),
            medium_percentage: pct(self.state_counts[1]),
            large_percentage: pct(self.state_counts[2]),
            avg_recent_size: avg_size,
            avg_recent_interval: avg_interval,
        }
    }

    pub fn reset(&mut self) {
        self.current_state = SizeBucket::Medium;
        self.last_size = 512;
        self.size_history.clear();
        self.interval_history.clear();
        self.burst_mode = false;
        self.burst_remaining = 0;
        self.state_counts = [0; 3];
        self.total_packets = 0;
    }

    pub fn last_size(&self) -> usize {
        self.last_size
    }
}

impl Default for CorrelationBreaker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T) {
    if history.len() == HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(value);
}
