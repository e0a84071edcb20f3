// Protocol mimicry
//
// Builds session-shaped sequences of (size, delay) steps: page loads with
// reading pauses, buffered video with keyframes, codec-paced voice, MTU-bound
// bulk transfer and tick-driven game state.

use super::adversarial::MlResistantGenerator;
use super::correlation::CorrelationBreaker;
use super::sampling::uniform;
use super::state_machine::{ProtocolStateMachine, ProtocolType};
use crate::profile::TrafficProfile;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Probability that a shaped step is replaced by an adversarial sample
const ADVERSARIAL_SHARE: f64 = 0.08;
const DEFAULT_FILE_MBPS: f64 = 10.0;

/// One step of a session pattern: payload size before obfuscation and the
/// gap to the next step
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PatternStep {
    pub size: usize,
    pub delay: f64,
}

impl PatternStep {
    pub fn new(size: usize, delay: f64) -> Self {
        Self {
            size,
            delay: delay.max(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoQuality {
    P360,
    P480,
    P720,
    P1080,
}

impl VideoQuality {
    pub const ALL: [VideoQuality; 4] = [VideoQuality::P360, VideoQuality::P480, VideoQuality::P720, VideoQuality::P1080];

    pub fn bitrate_kbps(self) -> usize {
        match self {
            VideoQuality::P360 => 1000,
            VideoQuality::P480 => 2500,
            VideoQuality::P720 => 5000,
            VideoQuality::P1080 => 8000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoipCodec {
    G711,
    G729,
    Opus,
}

impl VoipCodec {
    pub const ALL: [VoipCodec; 3] = [VoipCodec::G711, VoipCodec::G729, VoipCodec::Opus];
}

/// Session pattern builder
pub struct ProtocolMimicry {
    rng: StdRng,
    correlation: CorrelationBreaker,
    adversarial: MlResistantGenerator,
    state_machine: Option<(TrafficProfile, ProtocolStateMachine)>,
}

impl ProtocolMimicry {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(mut rng: StdRng) -> Self {
        let correlation = CorrelationBreaker::with_rng(child_rng(&mut rng));
        let adversarial = MlResistantGenerator::with_rng(child_rng(&mut rng));
        Self {
            rng,
            correlation,
            adversarial,
            state_machine: None,
        }
    }

    /// Page fetch burst, asset burst, reading pause, background polling
    pub fn web_browsing_session(&mut self) -> Vec<PatternStep> {
        let rng = &mut self.rng;
        let mut steps = Vec::new();
        for _ in 0..rng.gen_range(6..=14) {
            steps.push(PatternStep::new(rng.gen_range(300..=1800), uniform(rng, 0.005, 0.03)));
        }
        for _ in 0..rng.gen_range(8..=22) {
            steps.push(PatternStep::new(rng.gen_range(800..=4000), uniform(rng, 0.01, 0.06)));
        }
        steps.push(PatternStep::new(0, uniform(rng, 1.2, 6.0)));
        for _ in 0..rng.gen_range(4..=10) {
            steps.push(PatternStep::new(rng.gen_range(80..=400), uniform(rng, 0.3, 1.5)));
        }
        steps
    }

    /// Startup buffering, ~10 s of 100 Hz frames, then keyframe bursts
    pub fn video_streaming_session(&mut self, quality: Option<VideoQuality>) -> Vec<PatternStep> {
        let rng = &mut self.rng;
        let quality = quality.unwrap_or_else(|| *VideoQuality::ALL.choose(rng).unwrap_or(&VideoQuality::P720));
        let bytes_per_sec = (quality.bitrate_kbps() * 1024 / 8) as f64;
        let per_frame = bytes_per_sec / 100.0;

        let mut steps = Vec::with_capacity(1_120);
        for _ in 0..100 {
            let size = (per_frame * uniform(rng, 0.9, 1.2)) as usize;
            steps.push(PatternStep::new(size.max(200), 0.01));
        }
        for _ in 0..1_000 {
            let size = (per_frame * uniform(rng, 0.95, 1.05)) as usize;
            steps.push(PatternStep::new(size.max(100), 0.01));
        }
        for _ in 0..rng.gen_range(5..=15) {
            let size = (bytes_per_sec * uniform(rng, 0.05, 0.15)) as usize;
            steps.push(PatternStep::new(size, 0.02));
        }
        steps
    }

    /// 20 ms codec frames with rare DTMF-like blips
    pub fn voip_call(&mut self, codec: Option<VoipCodec>) -> Vec<PatternStep> {
        let rng = &mut self.rng;
        let codec = codec.unwrap_or_else(|| *VoipCodec::ALL.choose(rng).unwrap_or(&VoipCodec::Opus));
        let frame = match codec {
            VoipCodec::G711 => 160.0,
            VoipCodec::G729 => 20.0,
            VoipCodec::Opus => f64::from(rng.gen_range(40u32..=120)),
        };

        let mut steps = Vec::with_capacity(3_030);
        for _ in 0..3_000 {
            let size = ((frame * uniform(rng, 0.9, 1.1)) as usize).max(10);
            steps.push(PatternStep::new(size, 0.02 * uniform(rng, 0.98, 1.02)));
            if rng.gen_bool(0.005) {
                steps.push(PatternStep::new(rng.gen_range(60..=120), 0.0));
            }
        }
        steps
    }

    /// Near-MTU packets paced to `target_mbps`, followed by a few stalls
    pub fn file_transfer_session(&mut self, target_mbps: f64) -> Vec<PatternStep> {
        let rng = &mut self.rng;
        let bytes_per_sec = target_mbps.max(0.5) * 1024.0 * 1024.0 / 8.0;
        let mtu_payload = rng.gen_range(1100..=1400) as f64;
        let interval = mtu_payload / bytes_per_sec;

        let mut steps = Vec::with_capacity(2_015);
        for _ in 0..2_000 {
            let size = (mtu_payload * uniform(rng, 0.92, 1.0)) as usize;
            steps.push(PatternStep::new(size, (interval * uniform(rng, 0.9, 1.1)).max(0.0005)));
        }
        for _ in 0..rng.gen_range(5..=15) {
            steps.push(PatternStep::new(0, uniform(rng, 0.01, 0.2)));
        }
        steps
    }

    /// Small state packets at tick rate with rare large updates
    pub fn gaming_session(&mut self) -> Vec<PatternStep> {
        let rng = &mut self.rng;
        let mut steps = Vec::with_capacity(4_100);
        for _ in 0..4_000 {
            steps.push(PatternStep::new(rng.gen_range(40..=220), uniform(rng, 0.01, 0.05)));
            if rng.gen_bool(0.02) {
                steps.push(PatternStep::new(rng.gen_range(400..=1200), 0.001));
            }
        }
        steps
    }

    /// Three to six sessions of randomly chosen concrete profiles
    pub fn mixed_session(&mut self) -> Vec<PatternStep> {
        let mut steps = Vec::new();
        for _ in 0..self.rng.gen_range(3..=6) {
            let profile = TrafficProfile::Mixed.concrete(&mut self.rng);
            steps.extend(self.for_profile(profile));
        }
        steps
    }

    pub fn for_profile(&mut self, profile: TrafficProfile) -> Vec<PatternStep> {
        match profile {
            TrafficProfile::Web => self.web_browsing_session(),
            TrafficProfile::Video => self.video_streaming_session(None),
            TrafficProfile::Voip => self.voip_call(None),
            TrafficProfile::File => self.file_transfer_session(DEFAULT_FILE_MBPS),
            TrafficProfile::Gaming => self.gaming_session(),
            TrafficProfile::Mixed => self.mixed_session(),
        }
    }

    /// `count` steps driven by the leaf engines
    ///
    /// A protocol state machine for the profile picks each raw sample, which
    /// then passes through the correlation breaker; a small share is replaced
    /// by adversarial samples. The state machine persists across calls so the
    /// connection ages, renegotiates and churns over a long run.
    pub fn shaped_session(&mut self, profile: TrafficProfile, count: usize) -> Vec<PatternStep> {
        let mut machine = match self.state_machine.take() {
            Some((p, machine)) if p == profile => machine,
            _ => {
                let protocol = ProtocolType::for_profile(profile, &mut self.rng);
                ProtocolStateMachine::with_rng(protocol, child_rng(&mut self.rng))
            }
        };
        let engine_profile = profile.concrete(&mut self.rng);

        let mut sizes = Vec::with_capacity(count);
        let mut intervals = Vec::with_capacity(count);
        for _ in 0..count {
            if machine.should_terminate() {
                machine.reset();
            }
            machine.next_state();
            let (raw_size, raw_interval) = if self.rng.gen_bool(ADVERSARIAL_SHARE) {
                self.adversarial.generate_adversarial_packet(engine_profile, None)
            } else {
                machine.generate_packet_params()
            };

            if raw_size == 0 {
                // silent states (init/closed) stay silent
                sizes.push(0);
                intervals.push(raw_interval);
                continue;
            }
            sizes.push(self.correlation.get_correlated_size(raw_size, engine_profile));
            intervals.push(self.correlation.get_correlated_interval(raw_interval.max(0.0001), engine_profile));
        }
        let (sizes, intervals) = self.correlation.add_cross_correlation(sizes, intervals);

        self.state_machine = Some((profile, machine));
        sizes
            .into_iter()
            .zip(intervals)
            .map(|(size, delay)| PatternStep::new(size, delay))
            .collect()
    }

    /// Draw `(size, interval)` from the adversarial generator directly
    pub fn adversarial_step(&mut self, profile: TrafficProfile) -> PatternStep {
        let (size, interval) = self.adversarial.generate_adversarial_packet(profile, None);
        PatternStep::new(size, interval)
    }
}

impl Default for ProtocolMimicry {
    fn default() -> Self {
        Self::new()
    }
}

fn child_rng(rng: &mut StdRng) -> StdRng {
    StdRng::from_rng(rng).unwrap_or_else(|_| StdRng::from_entropy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mimicry(seed: u64) -> ProtocolMimicry {
        ProtocolMimicry::with_rng(StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_web_session_shape() {
        let mut m = mimicry(1);
        let steps = m.web_browsing_session();
        assert!(steps.len() >= 6 + 8 + 1 + 4 && steps.len() <= 14 + 22 + 1 + 10);
        let pauses: Vec<_> = steps.iter().filter(|s| s.size == 0).collect();
        assert_eq!(pauses.len(), 1);
        assert!(pauses[0].delay >= 1.2 && pauses[0].delay <= 6.0);
    }

    #[test]
    fn test_video_frames_follow_bitrate() {
        let mut m = mimicry(2);
        let steps = m.video_streaming_session(Some(VideoQuality::P720));
        let per_frame = 5000.0 * 1024.0 / 8.0 / 100.0;
        for step in &steps[100..1100] {
            assert!(step.size as f64 >= per_frame * 0.95 - 1.0);
            assert!(step.size as f64 <= per_frame * 1.05);
            assert_eq!(step.delay, 0.01);
        }
        assert!(steps.len() >= 1_105 && steps.len() <= 1_115);
    }

    #[test]
    fn test_voip_cadence() {
        let mut m = mimicry(3);
        let steps = m.voip_call(Some(VoipCodec::G711));
        let frames: Vec<_> = steps.iter().filter(|s| s.delay > 0.0).collect();
        assert_eq!(frames.len(), 3_000);
        assert!(frames.iter().all(|s| s.size >= 144 && s.size <= 176));
        assert!(frames.iter().all(|s| s.delay >= 0.0196 && s.delay <= 0.0204));
    }

    #[test]
    fn test_file_transfer_pacing() {
        let mut m = mimicry(4);
        let steps = m.file_transfer_session(10.0);
        assert!(steps[..2_000].iter().all(|s| s.size >= 1_000 && s.size <= 1_400 && s.delay >= 0.0005));
        assert!(steps[2_000..].iter().all(|s| s.size == 0));
    }

    #[test]
    fn test_gaming_mostly_small() {
        let mut m = mimicry(5);
        let steps = m.gaming_session();
        let small = steps.iter().filter(|s| s.size <= 220).count();
        assert_eq!(small, 4_000);
        assert!(steps.len() > 4_000);
    }

    #[test]
    fn test_every_profile_yields_steps() {
        let mut m = mimicry(6);
        for profile in TrafficProfile::CONCRETE.into_iter().chain([TrafficProfile::Mixed]) {
            assert!(!m.for_profile(profile).is_empty(), "{}", profile);
        }
    }

    #[test]
    fn test_shaped_session() {
        let mut m = mimicry(7);
        for profile in TrafficProfile::CONCRETE {
            let steps = m.shaped_session(profile, 300);
            assert_eq!(steps.len(), 300);
            assert!(steps.iter().any(|s| s.size > 0));
            assert!(steps.iter().all(|s| s.size <= 16_384 && s.delay >= 0.0));
        }
    }

    #[test]
    fn test_shaped_session_keeps_machine() {
        let mut m = mimicry(8);
        m.shaped_session(TrafficProfile::Voip, 10);
        let id = m.state_machine.as_ref().map(|(_, sm)| sm.session_id());
        m.shaped_session(TrafficProfile::Voip, 10);
        let protocol = m.state_machine.as_ref().map(|(_, sm)| sm.protocol());
        assert_eq!(protocol, Some(ProtocolType::Webrtc));
        assert!(id.is_some());
    }
}
