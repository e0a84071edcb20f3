// Padding strategies for size obfuscation
//
// Appends random bytes to a packet so its length no longer reveals the
// payload length. Padding only ever grows a packet.

use clap::ValueEnum;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_BUCKETS: [usize; 6] = [128, 256, 512, 1024, 1280, 1400];

/// How much padding to append to each packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum PaddingStrategy {
    None,
    /// Up to ~7% extra bytes, between 16 and 120
    #[default]
    Random,
    /// Round up to the next bucket boundary
    FixedBuckets,
    /// 0-20% extra bytes
    Progressive,
}

impl PaddingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            PaddingStrategy::None => "none",
            PaddingStrategy::Random => "random",
            PaddingStrategy::FixedBuckets => "fixed_buckets",
            PaddingStrategy::Progressive => "progressive",
        }
    }

    /// Number of padding bytes for a packet of `len` bytes
    ///
    /// # Arguments
    ///
    /// * `len` - Packet length before padding
    /// * `buckets` - Ascending bucket boundaries for `FixedBuckets`
    /// * `mtu` - Ceiling used when `len` exceeds every bucket
    pub fn padding_len<R: Rng + ?Sized>(self, rng: &mut R, len: usize, buckets: &[usize], mtu: usize) -> usize {
        match self {
            PaddingStrategy::None => 0,
            PaddingStrategy::Random => {
                let max_pad = ((len as f64 * 0.07) as usize).clamp(16, 120);
                rng.gen_range(0..=max_pad)
            }
            PaddingStrategy::Progressive => (len as f64 * rng.gen_range(0.0..=0.2)) as usize,
            PaddingStrategy::FixedBuckets => {
                let target = buckets
                    .iter()
                    .copied()
                    .find(|&b| len <= b)
                    .unwrap_or_else(|| buckets.iter().copied().max().unwrap_or(mtu).min(mtu));
                target.saturating_sub(len)
            }
        }
    }

    /// Append padding to `packet` in place
    pub fn apply<R: RngCore + ?Sized>(self, rng: &mut R, packet: &mut Vec<u8>, buckets: &[usize], mtu: usize) {
        let pad = self.padding_len(rng, packet.len(), buckets, mtu);
        if pad == 0 {
            return;
        }
        let start = packet.len();
        packet.resize(start + pad, 0);
        rng.fill_bytes(&mut packet[start..]);
    }
}

impl fmt::Display for PaddingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_none_leaves_packet_alone() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut data = vec![1, 2, 3];
        PaddingStrategy::None.apply(&mut rng, &mut data, &DEFAULT_BUCKETS, 1200);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn test_random_padding_bounds() {
        let mut rng = StdRng::seed_from_u64(2);
        for len in [0usize, 10, 500, 1000, 5000] {
            for _ in 0..200 {
                let pad = PaddingStrategy::Random.padding_len(&mut rng, len, &DEFAULT_BUCKETS, 1200);
                let max_pad = ((len as f64 * 0.07) as usize).clamp(16, 120);
                assert!(pad <= max_pad);
            }
        }
    }

    #[test]
    fn test_progressive_padding_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let pad = PaddingStrategy::Progressive.padding_len(&mut rng, 1000, &DEFAULT_BUCKETS, 1200);
            assert!(pad <= 200);
        }
    }

    #[test]
    fn test_fixed_buckets_round_up() {
        let mut rng = StdRng::seed_from_u64(4);
        let s = PaddingStrategy::FixedBuckets;
        assert_eq!(s.padding_len(&mut rng, 100, &DEFAULT_BUCKETS, 1200), 28);
        assert_eq!(s.padding_len(&mut rng, 128, &DEFAULT_BUCKETS, 1200), 0);
        assert_eq!(s.padding_len(&mut rng, 129, &DEFAULT_BUCKETS, 1200), 127);
        // larger than every bucket: target is min(max bucket, mtu), never shrinks
        assert_eq!(s.padding_len(&mut rng, 1300, &[128, 256], 1200), 0);
        assert_eq!(s.padding_len(&mut rng, 200, &[128], 1200), 0);
        assert_eq!(s.padding_len(&mut rng, 1500, &DEFAULT_BUCKETS, 1600), 0);
    }

    #[test]
    fn test_padding_preserves_prefix() {
        let mut rng = StdRng::seed_from_u64(5);
        let original = vec![9u8; 300];
        let mut data = original.clone();
        PaddingStrategy::FixedBuckets.apply(&mut rng, &mut data, &DEFAULT_BUCKETS, 1200);
        assert_eq!(data.len(), 512);
        assert_eq!(&data[..300], original.as_slice());
    }

    #[test]
    fn test_cli_names() {
        assert_eq!(
            PaddingStrategy::from_str("fixed_buckets", true).unwrap(),
            PaddingStrategy::FixedBuckets
        );
        assert_eq!(PaddingStrategy::Progressive.to_string(), "progressive");
    }
}
