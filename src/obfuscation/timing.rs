// Adaptive timing model for simulated network delay
//
// Produces a per-packet delay from transmission, propagation, queueing and
// jitter components, with simulated loss substituting a retransmission timeout.

use super::sampling::{gauss, uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;

/// Smallest delay ever returned, in seconds
pub const MIN_DELAY: f64 = 0.0001;

/// Upper bound on the retransmission timeout, in seconds
const MAX_RTO: f64 = 60.0;
/// Jitter history length
const JITTER_HISTORY: usize = 100;
/// Simulated service rate of the bottleneck queue (packets per second)
const SERVICE_RATE: f64 = 100.0;
/// RTT smoothing gains
const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;

/// Snapshot returned by [`AdaptiveTimingModel::statistics`]
#[derive(Debug, Clone, Serialize)]
pub struct TimingStatistics {
    pub base_rtt: f64,
    pub smooth_rtt: f64,
    pub min_rtt: f64,
    pub max_rtt: f64,
    pub rtt_variance: f64,
    pub congestion_level: f64,
    pub packet_loss_rate: f64,
    pub total_packets: u64,
    pub lost_packets: u64,
    pub retransmitted_packets: u64,
    pub loss_percentage: f64,
    pub bandwidth_estimate_mbps: f64,
    pub cwnd: f64,
    pub queue_depth: f64,
}

/// Network delay simulator with TCP-like congestion state
///
/// Congestion and loss are local decisions; nothing here observes a real link.
#[derive(Debug, Clone)]
pub struct AdaptiveTimingModel {
    base_rtt: f64,
    jitter_factor: f64,
    jitter_history: VecDeque<f64>,
    congestion_level: f64,
    packet_loss_rate: f64,

    /// Bytes per second
    bandwidth_estimate: f64,
    queue_depth: f64,
    max_queue_depth: f64,

    min_rtt: f64,
    max_rtt: f64,
    smooth_rtt: f64,
    rtt_variance: f64,

    cwnd: f64,
    ssthresh: f64,
    in_slow_start: bool,

    total_packets: u64,
    lost_packets: u64,
    retransmitted_packets: u64,
    consecutive_retransmits: u32,

    rng: StdRng,
}

impl AdaptiveTimingModel {
    /// Create a timing model
    ///
    /// # Arguments
    ///
    /// * `base_rtt` - Base round-trip time in seconds
    /// * `jitter_factor` - Jitter scale relative to `base_rtt`, clamped to [0, 1]
    pub fn new(base_rtt: f64, jitter_factor: f64) -> Self {
        Self::with_rng(base_rtt, jitter_factor, StdRng::from_entropy())
    }

    /// Create a timing model driven by the given RNG
    pub fn with_rng(base_rtt: f64, jitter_factor: f64, rng: StdRng) -> Self {
        let base_rtt = if base_rtt > 0.0 { base_rtt } else { 0.02 };
        Self {
            base_rtt,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            jitter_history: VecDeque::with_capacity(JITTER_HISTORY),
            congestion_level: 0.0,
            packet_loss_rate: 0.001,
            bandwidth_estimate: 10.0 * 1024.0 * 1024.0,
            queue_depth: 0.0,
            max_queue_depth: 50.0,
            min_rtt: base_rtt,
            max_rtt: base_rtt * 10.0,
            smooth_rtt: base_rtt,
            rtt_variance: base_rtt * 0.1,
            cwnd: 10.0,
            ssthresh: 65535.0,
            in_slow_start: true,
            total_packets: 0,
            lost_packets: 0,
            retransmitted_packets: 0,
            consecutive_retransmits: 0,
            rng,
        }
    }

    /// Delay in seconds for a packet of `packet_size` bytes under `network_load` in [0, 1]
    ///
    /// A simulated drop returns the retransmission timeout instead of the
    /// normal delay and leaves the RTT estimate untouched.
    pub fn get_delay(&mut self, packet_size: usize, network_load: f64) -> f64 {
        self.total_packets += 1;
        let load = if network_load.is_finite() {
            network_load.clamp(0.0, 1.0)
        } else {
            0.5
        };

        let transmission = packet_size as f64 / self.bandwidth_estimate;
        self.update_congestion(load);
        let propagation = self.base_rtt * (1.0 + self.congestion_level * 3.0);
        let queueing = self.queue_delay(load);
        let jitter = self.correlated_jitter();

        if self.should_drop(load) {
            self.lost_packets += 1;
            self.retransmitted_packets += 1;
            self.consecutive_retransmits = self.consecutive_retransmits.saturating_add(1);
            return self.rto().max(MIN_DELAY);
        }
        self.consecutive_retransmits = 0;

        let total = transmission + propagation + queueing + jitter;
        self.update_rtt_estimate(total);
        total.max(MIN_DELAY)
    }

    fn update_congestion(&mut self, load: f64) {
        if self.rng.gen_bool(0.05) {
            let spike = uniform(&mut self.rng, 0.1, 0.3) * load;
            self.congestion_level = (self.congestion_level + spike).min(1.0);
        } else {
            let recovery = 0.01 * (1.0 - load);
            self.congestion_level = (self.congestion_level - recovery).max(0.0);
        }

        if self.congestion_level > 0.5 {
            self.cwnd = (self.cwnd / 2.0).floor().max(1.0);
            self.ssthresh = self.cwnd;
            self.in_slow_start = false;
        } else if self.in_slow_start {
            self.cwnd = (self.cwnd * 2.0).min(self.ssthresh);
            if self.cwnd >= self.ssthresh {
                self.in_slow_start = false;
            }
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }
    }

    /// M/M/1 queue with Little's law
    fn queue_delay(&mut self, load: f64) -> f64 {
        let arrival = load * SERVICE_RATE;
        if arrival < SERVICE_RATE {
            let utilization = arrival / SERVICE_RATE;
            self.queue_depth = (utilization / (1.0 - utilization)).min(self.max_queue_depth);
        } else {
            self.queue_depth = self.max_queue_depth;
        }
        (self.queue_depth / SERVICE_RATE) * uniform(&mut self.rng, 0.5, 1.5)
    }

    fn correlated_jitter(&mut self) -> f64 {
        let scale = self.base_rtt * self.jitter_factor;
        let fresh = gauss(&mut self.rng, 0.0, scale);
        let jitter = match self.jitter_history.back() {
            Some(prev) => {
                let mut j = prev * 0.7 + fresh * 0.3;
                if self.rng.gen_bool(0.02) {
                    let spike = uniform(&mut self.rng, 2.0, 5.0) * scale;
                    j += if self.rng.gen_bool(0.5) { spike } else { -spike };
                }
                j
            }
            None => fresh,
        };
        if self.jitter_history.len() == JITTER_HISTORY {
            self.jitter_history.pop_front();
        }
        self.jitter_history.push_back(jitter);
        jitter
    }

    fn should_drop(&mut self, load: f64) -> bool {
        let congestion_loss = self.congestion_level * 0.05;
        let load_loss = if load > 0.9 { (load - 0.9) * 0.1 } else { 0.0 };
        let burst_loss = if self.rng.gen_bool(0.001) { 0.1 } else { 0.0 };
        let rate = (self.packet_loss_rate + congestion_loss + load_loss + burst_loss).clamp(0.0, 0.2);
        self.rng.gen_bool(rate)
    }

    /// Jacobson RTO with exponential backoff on consecutive retransmissions
    fn rto(&self) -> f64 {
        let exponent = self.consecutive_retransmits.saturating_sub(1).min(6);
        let backoff = f64::from(1u32 << exponent).min(64.0);
        let rto = (self.smooth_rtt + 4.0 * self.rtt_variance) * backoff;
        rto.clamp(self.base_rtt * 2.0, MAX_RTO)
    }

    fn update_rtt_estimate(&mut self, measured: f64) {
        self.smooth_rtt = (1.0 - RTT_ALPHA) * self.smooth_rtt + RTT_ALPHA * measured;
        let deviation = (measured - self.smooth_rtt).abs();
        self.rtt_variance = (1.0 - RTT_BETA) * self.rtt_variance + RTT_BETA * deviation;
        self.min_rtt = self.min_rtt.min(measured);
        self.max_rtt = self.max_rtt.max(measured);
    }

    /// Fold observed network samples into the model
    ///
    /// # Arguments
    ///
    /// * `rtt_sample` - Observed RTT in seconds
    /// * `bandwidth_sample` - Observed bandwidth in bytes per second
    /// * `loss_rate_sample` - Observed loss rate in [0, 1]
    pub fn update_network_conditions(
        &mut self,
        rtt_sample: Option<f64>,
        bandwidth_sample: Option<f64>,
        loss_rate_sample: Option<f64>,
    ) {
        if let Some(rtt) = rtt_sample.filter(|r| *r > 0.0) {
            self.base_rtt = self.base_rtt * 0.8 + rtt * 0.2;
            self.update_rtt_estimate(rtt);
        }
        if let Some(bw) = bandwidth_sample.filter(|b| *b > 0.0) {
            self.bandwidth_estimate = self.bandwidth_estimate * 0.9 + bw * 0.1;
        }
        if let Some(loss) = loss_rate_sample {
            let loss = loss.clamp(0.0, 1.0);
            self.packet_loss_rate = self.packet_loss_rate * 0.9 + loss * 0.1;
        }
    }

    pub fn statistics(&self) -> TimingStatistics {
        TimingStatistics {
            base_rtt: self.base_rtt,
            smooth_rtt: self.smooth_rtt,
            min_rtt: self.min_rtt,
            max_rtt: self.max_rtt,
            rtt_variance: self.rtt_variance,
            congestion_level: self.congestion_level,
            packet_loss_rate: self.packet_loss_rate,
            total_packets: self.total_packets,
            lost_packets: self.lost_packets,
            retransmitted_packets: self.retransmitted_packets,
            loss_percentage: self.lost_packets as f64 / self.total_packets.max(1) as f64 * 100.0,
            bandwidth_estimate_mbps: self.bandwidth_estimate * 8.0 / (1024.0 * 1024.0),
            cwnd: self.cwnd,
            queue_depth: self.queue_depth,
        }
    }

    /// Zero the packet counters, keeping network state
    pub fn reset_statistics(&mut self) {
        self.total_packets = 0;
        self.lost_packets = 0;
        self.retransmitted_packets = 0;
        self.consecutive_retransmits = 0;
    }

    pub fn congestion_level(&self) -> f64 {
        self.congestion_level
    }

    pub fn base_rtt(&self) -> f64 {
        self.base_rtt
    }
}

impl Default for AdaptiveTimingModel {
    /// 20 ms base RTT with 30% jitter
    fn default() -> Self {
        Self::new(0.02, 0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> AdaptiveTimingModel {
        AdaptiveTimingModel::with_rng(0.02, 0.3, StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_timing_model_defaults() {
        let model = AdaptiveTimingModel::default();
        let stats = model.statistics();
        assert_eq!(stats.base_rtt, 0.02);
        assert_eq!(stats.smooth_rtt, 0.02);
        assert_eq!(stats.cwnd, 10.0);
        assert_eq!(stats.total_packets, 0);
        assert!((stats.bandwidth_estimate_mbps - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_factor_clamped() {
        let model = AdaptiveTimingModel::new(0.02, 4.0);
        assert_eq!(model.jitter_factor, 1.0);
        let model = AdaptiveTimingModel::new(0.02, -1.0);
        assert_eq!(model.jitter_factor, 0.0);
    }

    #[test]
    fn test_delay_never_below_floor() {
        let mut model = seeded(11);
        for i in 0..20_000 {
            let load = (i % 11) as f64 / 10.0;
            let delay = model.get_delay(64 + (i % 1400), load);
            assert!(delay >= MIN_DELAY, "delay {} below floor", delay);
            assert!(delay <= MAX_RTO);
        }
        assert_eq!(model.statistics().total_packets, 20_000);
    }

    #[test]
    fn test_congestion_never_decreases_at_full_load() {
        let mut model = seeded(5);
        let mut previous = model.congestion_level();
        for _ in 0..5_000 {
            model.get_delay(1200, 1.0);
            let current = model.congestion_level();
            assert!(current >= previous);
            previous = current;
        }
        assert!(previous > 0.5);
    }

    #[test]
    fn test_congestion_recovers_when_idle() {
        let mut model = seeded(9);
        for _ in 0..2_000 {
            model.get_delay(1200, 1.0);
        }
        let congested = model.congestion_level();
        for _ in 0..2_000 {
            model.get_delay(100, 0.0);
        }
        assert!(model.congestion_level() < congested);
    }

    #[test]
    fn test_slow_start_doubles_until_threshold() {
        let mut model = seeded(1);
        model.ssthresh = 80.0;
        // zero load keeps any spike at zero, so the window must grow
        model.update_congestion(0.0);
        assert_eq!(model.cwnd, 20.0);
        assert!(model.in_slow_start);
        model.update_congestion(0.0);
        model.update_congestion(0.0);
        assert_eq!(model.cwnd, 80.0);
        assert!(!model.in_slow_start);
        model.update_congestion(0.0);
        assert!((model.cwnd - 80.0125).abs() < 1e-9);
    }

    #[test]
    fn test_rto_bounds_and_backoff() {
        let mut model = seeded(2);
        model.consecutive_retransmits = 1;
        let first = model.rto();
        model.consecutive_retransmits = 3;
        let third = model.rto();
        assert!(third >= first);
        assert!(first >= model.base_rtt * 2.0);
        model.consecutive_retransmits = 40;
        assert!(model.rto() <= MAX_RTO);
    }

    #[test]
    fn test_losses_counted() {
        let mut model = seeded(3);
        for _ in 0..50_000 {
            model.get_delay(1000, 1.0);
        }
        let stats = model.statistics();
        assert!(stats.lost_packets > 0);
        assert_eq!(stats.lost_packets, stats.retransmitted_packets);
        model.reset_statistics();
        let stats = model.statistics();
        assert_eq!(stats.total_packets, 0);
        assert_eq!(stats.lost_packets, 0);
    }

    #[test]
    fn test_update_network_conditions() {
        let mut model = seeded(4);
        model.update_network_conditions(Some(0.1), None, None);
        assert!((model.base_rtt() - (0.02 * 0.8 + 0.1 * 0.2)).abs() < 1e-12);
        let before = model.statistics().bandwidth_estimate_mbps;
        model.update_network_conditions(None, Some(100.0 * 1024.0 * 1024.0), Some(0.5));
        let stats = model.statistics();
        assert!(stats.bandwidth_estimate_mbps > before);
        assert!((stats.packet_loss_rate - (0.001 * 0.9 + 0.05)).abs() < 1e-12);
        // invalid samples are ignored
        model.update_network_conditions(Some(-1.0), Some(0.0), None);
        assert!((model.base_rtt() - 0.036).abs() < 1e-12);
    }
}
