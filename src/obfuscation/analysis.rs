//! Statistical self-checks on generated traffic.
//!
//! Used by tests and diagnostics to confirm that emitted payloads look
//! encrypted and that packet timing does not collapse onto one period.

use super::entropy::shannon_bits_per_byte;
use serde::Serialize;

const HISTOGRAM_BINS: usize = 20;
const MIN_SAMPLES: usize = 5;

/// Variation and dominant-period hints for a packet trace
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeriodicityReport {
    /// Coefficient of variation of packet sizes
    pub sizes_cv: Option<f64>,
    /// Coefficient of variation of inter-arrival gaps
    pub intervals_cv: Option<f64>,
    /// Centre of the most populated gap histogram bin, milliseconds
    pub interval_peak_ms: Option<f64>,
}

pub struct StatisticalAnalyzer;

impl StatisticalAnalyzer {
    /// Shannon entropy in bits per byte, within [0, 8]
    pub fn entropy_bits_per_byte(data: &[u8]) -> f64 {
        shannon_bits_per_byte(data).clamp(0.0, 8.0)
    }

    pub fn entropy_normalized(data: &[u8]) -> f64 {
        Self::entropy_bits_per_byte(data) / 8.0
    }

    /// Size and gap variation of a trace
    ///
    /// Returns an empty report when fewer than five sizes or timestamps are
    /// supplied. Non-positive gaps are ignored.
    pub fn detect_periodicity(packet_sizes: &[usize], packet_times: &[f64]) -> PeriodicityReport {
        let mut report = PeriodicityReport::default();
        if packet_sizes.len() < MIN_SAMPLES || packet_times.len() < MIN_SAMPLES {
            return report;
        }

        let sizes: Vec<f64> = packet_sizes.iter().map(|&s| s as f64).collect();
        report.sizes_cv = coefficient_of_variation(&sizes);

        let intervals: Vec<f64> = packet_times
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|&d| d > 0.0)
            .collect();
        if intervals.len() > 1 {
            report.intervals_cv = coefficient_of_variation(&intervals);
            report.interval_peak_ms = histogram_peak(&intervals).map(|p| p * 1000.0);
        }
        report
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let (mean, std) = mean_and_std(values);
    if mean == 0.0 {
        None
    } else {
        Some(std / mean)
    }
}

/// Centre of the fullest of 20 equal-width bins spanning the data
fn histogram_peak(values: &[f64]) -> Option<f64> {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !hi.is_finite() {
        return None;
    }
    if hi <= lo {
        return Some(lo);
    }

    let width = (hi - lo) / HISTOGRAM_BINS as f64;
    let mut bins = [0usize; HISTOGRAM_BINS];
    for &v in values {
        let idx = (((v - lo) / width) as usize).min(HISTOGRAM_BINS - 1);
        bins[idx] += 1;
    }
    // first maximum wins
    let mut peak = 0;
    for (i, &count) in bins.iter().enumerate() {
        if count > bins[peak] {
            peak = i;
        }
    }
    Some(lo + width * (peak as f64 + 0.5))
}
