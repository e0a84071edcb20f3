// Classifier-resistant packet generation
//
// Draws (size, interval) pairs from empirically shaped per-profile tables,
// injects the anomalies real captures contain, and nudges running statistics
// toward the profile's target features.

use super::sampling::{gauss, uniform, uniform_usize, weighted_choice};
use super::timing::AdaptiveTimingModel;
use crate::profile::TrafficProfile;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;

/// Share of packets emitted as anomalies
const ANOMALY_RATE: f64 = 0.05;
/// Relative Gaussian noise on sizes, log-normal sigma on intervals
const NOISE_FACTOR: f64 = 0.15;
const FEATURE_HISTORY: usize = 100;
const FEATURE_WINDOW: usize = 20;
const LOAD_WINDOW: usize = 50;
const SIZE_BOUNDARIES: [f64; 6] = [64.0, 128.0, 256.0, 512.0, 1024.0, 1400.0];
const PROTOCOL_TIMINGS: [f64; 6] = [0.001, 0.008, 0.016, 0.020, 0.033, 0.040];

/// Empirical shape of one profile
#[derive(Debug, Clone, Copy)]
pub struct ProfilePattern {
    pub sizes: &'static [(usize, f64)],
    pub intervals: &'static [(f64, f64)],
    pub burst_probability: f64,
    pub idle_probability: f64,
    pub target_avg_size: f64,
    pub target_size_deviation: f64,
}

const WEB: ProfilePattern = ProfilePattern {
    sizes: &[(64, 0.1), (128, 0.1), (256, 0.15), (512, 0.2), (576, 0.15), (1024, 0.15), (1400, 0.15)],
    intervals: &[(0.001, 0.2), (0.005, 0.25), (0.01, 0.2), (0.02, 0.15), (0.05, 0.15), (0.1, 0.05)],
    burst_probability: 0.3,
    idle_probability: 0.2,
    target_avg_size: 680.0,
    target_size_deviation: 400.0,
};

const VIDEO: ProfilePattern = ProfilePattern {
    sizes: &[(1200, 0.15), (1300, 0.2), (1350, 0.3), (1380, 0.2), (1400, 0.15)],
    intervals: &[(0.008, 0.25), (0.016, 0.35), (0.033, 0.25), (0.040, 0.15)],
    burst_probability: 0.1,
    idle_probability: 0.05,
    target_avg_size: 1340.0,
    target_size_deviation: 80.0,
};

const VOIP: ProfilePattern = ProfilePattern {
    sizes: &[(20, 0.1), (40, 0.2), (60, 0.3), (80, 0.3), (160, 0.1)],
    intervals: &[(0.020, 1.0)],
    burst_probability: 0.02,
    idle_probability: 0.01,
    target_avg_size: 80.0,
    target_size_deviation: 40.0,
};

const GAMING: ProfilePattern = ProfilePattern {
    sizes: &[(40, 0.25), (80, 0.3), (120, 0.2), (200, 0.15), (400, 0.08), (800, 0.02)],
    intervals: &[(0.016, 0.5), (0.033, 0.35), (0.050, 0.15)],
    burst_probability: 0.4,
    idle_probability: 0.1,
    target_avg_size: 150.0,
    target_size_deviation: 120.0,
};

const FILE: ProfilePattern = ProfilePattern {
    sizes: &[(1400, 1.0)],
    intervals: &[(0.001, 0.6), (0.002, 0.3), (0.003, 0.1)],
    burst_probability: 0.8,
    idle_probability: 0.3,
    target_avg_size: 1380.0,
    target_size_deviation: 50.0,
};

const MIXED: ProfilePattern = ProfilePattern {
    sizes: &[(64, 0.15), (128, 0.15), (256, 0.2), (512, 0.2), (1024, 0.15), (1400, 0.15)],
    intervals: &[(0.001, 0.2), (0.01, 0.25), (0.02, 0.25), (0.05, 0.2), (0.1, 0.1)],
    burst_probability: 0.25,
    idle_probability: 0.15,
    target_avg_size: 600.0,
    target_size_deviation: 500.0,
};

pub fn profile_pattern(profile: TrafficProfile) -> &'static ProfilePattern {
    match profile {
        TrafficProfile::Web => &WEB,
        TrafficProfile::Video => &VIDEO,
        TrafficProfile::Voip => &VOIP,
        TrafficProfile::Gaming => &GAMING,
        TrafficProfile::File => &FILE,
        TrafficProfile::Mixed => &MIXED,
    }
}

/// Anomaly shapes found in real captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anomaly {
    Tiny,
    Jumbo,
    Burst,
    Idle,
    Fragment,
    Duplicate,
}

const ANOMALIES: [(Anomaly, f64); 6] = [
    (Anomaly::Tiny, 0.1),
    (Anomaly::Jumbo, 0.1),
    (Anomaly::Burst, 0.3),
    (Anomaly::Idle, 0.1),
    (Anomaly::Fragment, 0.2),
    (Anomaly::Duplicate, 0.2),
];

/// Phase of a synthetic session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStage {
    Start,
    Active,
    Idle,
    End,
}

/// What a session packet represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Data(SessionStage),
    Handshake,
    Retransmission,
    Ack,
    QuicAck,
    Migration,
    Rtcp,
    Fec,
    StateUpdate,
    Ping,
}

/// One packet of a generated session; `time` is seconds from session start
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionPacket {
    pub size: usize,
    pub time: f64,
    pub kind: PacketKind,
}

#[derive(Debug, Clone, Copy)]
struct Feature {
    size: usize,
    interval: f64,
    at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdversarialStatistics {
    pub packet_count: u64,
    pub anomaly_count: u64,
    pub avg_size: Option<f64>,
    pub size_deviation: Option<f64>,
    pub avg_interval: Option<f64>,
    pub interval_deviation: Option<f64>,
}

/// Generator of (size, interval) pairs meant to defeat traffic classifiers
pub struct MlResistantGenerator {
    feature_history: VecDeque<Feature>,
    packet_count: u64,
    anomaly_count: u64,
    rng: StdRng,
}

impl MlResistantGenerator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            feature_history: VecDeque::with_capacity(FEATURE_HISTORY),
            packet_count: 0,
            anomaly_count: 0,
            rng,
        }
    }

    /// Next `(size, interval)` for `profile`
    ///
    /// When a timing model is supplied its delay replaces the sampled interval,
    /// driven by a load estimate from the recent packet rate.
    pub fn generate_adversarial_packet(
        &mut self,
        profile: TrafficProfile,
        timing_model: Option<&mut AdaptiveTimingModel>,
    ) -> (usize, f64) {
        self.packet_count += 1;
        let pattern = profile_pattern(profile);

        let (size, interval) = if self.rng.gen_bool(ANOMALY_RATE) {
            self.anomaly_count += 1;
            self.anomaly(pattern)
        } else {
            let (size, interval) = self.adversarial_normal(pattern);
            // keep ordinary packets out of anomaly territory
            (size.clamp(65, 1399), interval.min(0.99))
        };

        let (size, mut interval) = self.obfuscate_features(size, interval, pattern);

        if let Some(model) = timing_model {
            let load = self.estimate_network_load();
            interval = model.get_delay(size, load);
        }

        if self.feature_history.len() == FEATURE_HISTORY {
            self.feature_history.pop_front();
        }
        self.feature_history.push_back(Feature {
            size,
            interval,
            at: Instant::now(),
        });
        (size, interval)
    }

    fn pick_size(&mut self, pattern: &ProfilePattern) -> usize {
        weighted_choice(&mut self.rng, pattern.sizes).copied().unwrap_or(512)
    }

    fn anomaly(&mut self, pattern: &ProfilePattern) -> (usize, f64) {
        match weighted_choice(&mut self.rng, &ANOMALIES).copied().unwrap_or(Anomaly::Burst) {
            Anomaly::Tiny => {
                let interval = *[0.001, 0.01, 0.1].choose(&mut self.rng).unwrap_or(&0.01);
                (self.rng.gen_range(1..=64), interval)
            }
            Anomaly::Jumbo => (1400, uniform(&mut self.rng, 0.001, 0.005)),
            Anomaly::Burst => {
                let size = self.pick_size(pattern);
                (size, uniform(&mut self.rng, 0.0001, 0.001))
            }
            Anomaly::Idle => (self.rng.gen_range(64..=128), uniform(&mut self.rng, 1.0, 5.0)),
            Anomaly::Fragment => (self.rng.gen_range(500..=700), 0.0001),
            // retransmission of the previous packet after a timeout
            Anomaly::Duplicate => {
                let size = match self.feature_history.back() {
                    Some(last) => last.size,
                    None => self.pick_size(pattern),
                };
                (size, 0.2)
            }
        }
    }

    fn adversarial_normal(&mut self, pattern: &ProfilePattern) -> (usize, f64) {
        let base_size = self.pick_size(pattern) as f64;
        let base_interval = weighted_choice(&mut self.rng, pattern.intervals).copied().unwrap_or(0.01);

        let mut size = base_size + gauss(&mut self.rng, 0.0, base_size * NOISE_FACTOR);
        if self.rng.gen_bool(0.05) {
            // just off a canonical boundary
            let closest = SIZE_BOUNDARIES
                .iter()
                .copied()
                .min_by(|a, b| (a - size).abs().total_cmp(&(b - size).abs()))
                .unwrap_or(512.0);
            size = closest + f64::from(self.rng.gen_range(-10..=10));
        }
        let size = size.clamp(1.0, 1400.0) as usize;

        let mut interval = (base_interval.max(0.0001).ln() + gauss(&mut self.rng, 0.0, NOISE_FACTOR)).exp();
        if self.rng.gen_bool(0.05) {
            let exact = *PROTOCOL_TIMINGS.choose(&mut self.rng).unwrap_or(&0.02);
            interval = exact * uniform(&mut self.rng, 0.99, 1.01);
        }

        // burst and idle odds are damped relative to the table
        if self.rng.gen_bool(pattern.burst_probability * 0.5) {
            interval *= uniform(&mut self.rng, 0.1, 0.3);
        } else if self.rng.gen_bool(pattern.idle_probability * 0.3) {
            interval *= uniform(&mut self.rng, 2.0, 5.0);
        } else {
            interval *= uniform(&mut self.rng, 0.8, 1.2);
        }
        (size, interval)
    }

    /// Steer the running mean and spread toward the profile's targets
    fn obfuscate_features(&mut self, size: usize, interval: f64, pattern: &ProfilePattern) -> (usize, f64) {
        if self.feature_history.is_empty() {
            return (size, interval);
        }

        let recent: Vec<f64> = self
            .feature_history
            .iter()
            .rev()
            .take(FEATURE_WINDOW)
            .map(|f| f.size as f64)
            .collect();
        let avg = recent.iter().sum::<f64>() / recent.len() as f64;

        let mut size = size as f64;
        if avg > pattern.target_avg_size * 1.2 {
            size *= uniform(&mut self.rng, 0.6, 0.9);
        } else if avg < pattern.target_avg_size * 0.8 {
            size *= uniform(&mut self.rng, 1.1, 1.4);
        }
        size = size.trunc();

        let deviation = if recent.len() > 1 {
            (recent.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / recent.len() as f64).sqrt()
        } else {
            pattern.target_size_deviation
        };
        if deviation < pattern.target_size_deviation * 0.8 {
            size += gauss(&mut self.rng, 0.0, pattern.target_size_deviation * 0.5);
        }

        (size.clamp(1.0, 1400.0) as usize, interval.max(0.0001))
    }

    /// Load in [0, 1] from the recent packet rate, 1000 pps being full load
    fn estimate_network_load(&mut self) -> f64 {
        let n = self.feature_history.len();
        if n < 2 {
            return 0.5;
        }
        let start = n.saturating_sub(LOAD_WINDOW);
        let (first, last) = (self.feature_history[start].at, self.feature_history[n - 1].at);
        let span = last.duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return 0.5;
        }
        let rate = (n - start) as f64 / span;
        let load = (rate / 1000.0).min(1.0) + gauss(&mut self.rng, 0.0, 0.1);
        load.clamp(0.0, 1.0)
    }

    /// Interleave profile-appropriate auxiliary packets into `packets`
    pub fn add_protocol_artifacts(&mut self, packets: Vec<SessionPacket>, profile: TrafficProfile) -> Vec<SessionPacket> {
        use TrafficProfile::*;
        let tcp_like = matches!(profile, Web | File);
        let quic_like = matches!(profile, Web | Video);
        let media = matches!(profile, Video | Voip);
        let gaming = profile == Gaming;

        let mut out = Vec::with_capacity(packets.len() * 2);
        for (i, pkt) in packets.into_iter().enumerate() {
            out.push(pkt);
            let at = |offset: f64, size: usize, kind: PacketKind| SessionPacket {
                size,
                time: pkt.time + offset,
                kind,
            };

            if tcp_like {
                if i < 3 {
                    out.push(at(0.001, self.rng.gen_range(40..=60), PacketKind::Handshake));
                }
                if self.rng.gen_bool(0.001) {
                    let delay = uniform(&mut self.rng, 0.2, 1.0);
                    out.push(at(delay, pkt.size, PacketKind::Retransmission));
                }
                if self.rng.gen_bool(0.1) {
                    out.push(at(0.001, self.rng.gen_range(40..=60), PacketKind::Ack));
                }
            }
            if quic_like {
                if self.rng.gen_bool(0.15) {
                    out.push(at(0.001, self.rng.gen_range(20..=80), PacketKind::QuicAck));
                }
                if self.rng.gen_bool(0.001) {
                    out.push(at(0.01, self.rng.gen_range(100..=200), PacketKind::Migration));
                }
            }
            if media {
                if i > 0 && i % 100 == 0 {
                    let delay = uniform(&mut self.rng, 0.01, 0.1);
                    out.push(at(delay, self.rng.gen_range(70..=90), PacketKind::Rtcp));
                }
                if self.rng.gen_bool(0.05) {
                    out.push(at(0.001, pkt.size / 2, PacketKind::Fec));
                }
            }
            if gaming {
                if self.rng.gen_bool(0.2) {
                    out.push(at(0.001, self.rng.gen_range(100..=300), PacketKind::StateUpdate));
                }
                if i > 0 && i % 30 == 0 {
                    out.push(at(0.001, self.rng.gen_range(20..=40), PacketKind::Ping));
                }
            }
        }
        out
    }

    /// Five-phase session of roughly `duration` seconds, sorted by time
    pub fn generate_session(&mut self, profile: TrafficProfile, duration: f64) -> Vec<SessionPacket> {
        const STAGES: [SessionStage; 5] = [
            SessionStage::Start,
            SessionStage::Active,
            SessionStage::Idle,
            SessionStage::Active,
            SessionStage::End,
        ];

        let duration = duration.max(0.0);
        let base = duration / STAGES.len() as f64;
        let mut remaining = duration;
        let mut packets = Vec::new();
        let mut now = 0.0;

        for (idx, stage) in STAGES.iter().copied().enumerate() {
            let stage_len = if idx + 1 == STAGES.len() {
                remaining
            } else {
                let d = (base * uniform(&mut self.rng, 0.5, 1.5)).min(remaining * 0.8);
                remaining -= d;
                d
            };
            let stage_packets = self.stage_traffic(stage, profile, stage_len, now);
            if let Some(last) = stage_packets.last() {
                now = last.time;
            }
            packets.extend(stage_packets);
        }

        let mut packets = self.add_protocol_artifacts(packets, profile);
        packets.sort_by(|a, b| a.time.total_cmp(&b.time));
        packets
    }

    fn stage_traffic(&mut self, stage: SessionStage, profile: TrafficProfile, duration: f64, start: f64) -> Vec<SessionPacket> {
        let mut packets: Vec<SessionPacket> = Vec::new();
        let end = start + duration;
        let mut now = start;

        while now < end {
            let (mut size, mut interval) = self.generate_adversarial_packet(profile, None);
            match stage {
                SessionStage::Start => {
                    interval *= 0.5;
                    if packets.len() < 10 {
                        size = uniform_usize(&mut self.rng, 40, 200);
                    }
                }
                SessionStage::Idle => {
                    interval *= uniform(&mut self.rng, 10.0, 50.0);
                    size = uniform_usize(&mut self.rng, 40, 100);
                }
                SessionStage::End => {
                    interval *= uniform(&mut self.rng, 1.0, 3.0);
                    if packets.len() > 5 {
                        break;
                    }
                }
                SessionStage::Active => {}
            }
            packets.push(SessionPacket {
                size,
                time: now,
                kind: PacketKind::Data(stage),
            });
            now += interval;
        }
        packets
    }

    pub fn statistics(&self) -> AdversarialStatistics {
        let sizes: Vec<f64> = self.feature_history.iter().map(|f| f.size as f64).collect();
        let intervals: Vec<f64> = self.feature_history.iter().map(|f| f.interval).collect();
        let (avg_size, size_deviation) = mean_and_deviation(&sizes);
        let (avg_interval, interval_deviation) = mean_and_deviation(&intervals);
        AdversarialStatistics {
            packet_count: self.packet_count,
            anomaly_count: self.anomaly_count,
            avg_size,
            size_deviation,
            avg_interval,
            interval_deviation,
        }
    }

    pub fn reset(&mut self) {
        self.feature_history.clear();
        self.packet_count = 0;
        self.anomaly_count = 0;
    }
}

impl Default for MlResistantGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn mean_and_deviation(values: &[f64]) -> (Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let deviation = if values.len() > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
    } else {
        0.0
    };
    (Some(mean), Some(deviation))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> MlResistantGenerator {
        MlResistantGenerator::with_rng(StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_weights_are_normalized() {
        for profile in TrafficProfile::CONCRETE.iter().chain([TrafficProfile::Mixed].iter()) {
            let p = profile_pattern(*profile);
            let sizes: f64 = p.sizes.iter().map(|(_, w)| w).sum();
            let intervals: f64 = p.intervals.iter().map(|(_, w)| w).sum();
            assert!((sizes - 1.0).abs() < 1e-9, "{} sizes", profile);
            assert!((intervals - 1.0).abs() < 1e-9, "{} intervals", profile);
        }
    }

    #[test]
    fn test_packets_stay_in_bounds() {
        let mut generator = seeded(1);
        for profile in TrafficProfile::CONCRETE {
            for _ in 0..2_000 {
                let (size, interval) = generator.generate_adversarial_packet(profile, None);
                assert!((1..=1400).contains(&size));
                assert!(interval >= 0.0001);
                assert!(interval <= 5.0);
            }
        }
        let stats = generator.statistics();
        assert_eq!(stats.packet_count, 10_000);
        assert!(stats.anomaly_count > 0);
    }

    #[test]
    fn test_video_mean_tracks_target() {
        let mut generator = seeded(2);
        let n = 5_000;
        let total: usize = (0..n)
            .map(|_| generator.generate_adversarial_packet(TrafficProfile::Video, None).0)
            .sum();
        let avg = total as f64 / n as f64;
        assert!(avg > 900.0, "video average {} too small", avg);
    }

    #[test]
    fn test_timing_model_supplies_interval() {
        let mut generator = seeded(3);
        let mut model = AdaptiveTimingModel::with_rng(0.05, 0.0, StdRng::seed_from_u64(3));
        for _ in 0..200 {
            let (_, interval) = generator.generate_adversarial_packet(TrafficProfile::Web, Some(&mut model));
            assert!(interval >= 0.0001);
        }
        assert_eq!(model.statistics().total_packets, 200);
    }

    #[test]
    fn test_artifacts_for_tcp_like_profiles() {
        let mut generator = seeded(4);
        let packets: Vec<SessionPacket> = (0..10)
            .map(|i| SessionPacket {
                size: 1000,
                time: i as f64,
                kind: PacketKind::Data(SessionStage::Active),
            })
            .collect();
        let out = generator.add_protocol_artifacts(packets, TrafficProfile::File);
        let handshakes = out.iter().filter(|p| p.kind == PacketKind::Handshake).count();
        assert_eq!(handshakes, 3);
        assert!(out.iter().all(|p| !matches!(p.kind, PacketKind::Rtcp | PacketKind::Ping | PacketKind::QuicAck)));
    }

    #[test]
    fn test_artifacts_for_media_and_gaming() {
        let mut generator = seeded(5);
        let packets: Vec<SessionPacket> = (0..201)
            .map(|i| SessionPacket {
                size: 100,
                time: i as f64 * 0.02,
                kind: PacketKind::Data(SessionStage::Active),
            })
            .collect();
        let voip = generator.add_protocol_artifacts(packets.clone(), TrafficProfile::Voip);
        assert_eq!(voip.iter().filter(|p| p.kind == PacketKind::Rtcp).count(), 2);
        assert!(voip.iter().filter(|p| p.kind == PacketKind::Fec).all(|p| p.size == 50));

        let gaming = generator.add_protocol_artifacts(packets, TrafficProfile::Gaming);
        assert_eq!(gaming.iter().filter(|p| p.kind == PacketKind::Ping).count(), 6);
    }

    #[test]
    fn test_session_is_sorted_and_phased() {
        let mut generator = seeded(6);
        let session = generator.generate_session(TrafficProfile::Gaming, 20.0);
        assert!(!session.is_empty());
        assert!(session.windows(2).all(|w| w[0].time <= w[1].time));
        assert!(session.iter().any(|p| p.kind == PacketKind::Data(SessionStage::Start)));
        assert!(session.iter().any(|p| p.kind == PacketKind::Data(SessionStage::Active)));
        let end_packets = session
            .iter()
            .filter(|p| p.kind == PacketKind::Data(SessionStage::End))
            .count();
        assert!(end_packets <= 6);
    }

    #[test]
    fn test_reset() {
        let mut generator = seeded(7);
        for _ in 0..10 {
            generator.generate_adversarial_packet(TrafficProfile::Mixed, None);
        }
        generator.reset();
        let stats = generator.statistics();
        assert_eq!(stats.packet_count, 0);
        assert!(stats.avg_size.is_none());
    }
}
