// Pseudo protocol headers
//
// Prepends an RTP-like or QUIC-like header so the first bytes of every
// datagram look like a media or QUIC flow. Sequence numbers, timestamps and
// packet numbers advance monotonically per obfuscator.

use crate::profile::TrafficProfile;
use byteorder::{BigEndian, WriteBytesExt};
use clap::ValueEnum;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

/// Pseudo-header prepended before padding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum HeaderMode {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "rtp", alias = "rtp_like")]
    #[value(name = "rtp", alias = "rtp_like")]
    RtpLike,
    #[serde(rename = "quic", alias = "quic_like")]
    #[value(name = "quic", alias = "quic_like")]
    QuicLike,
}

impl HeaderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderMode::None => "none",
            HeaderMode::RtpLike => "rtp",
            HeaderMode::QuicLike => "quic",
        }
    }
}

impl fmt::Display for HeaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stream counters behind the pseudo-headers
#[derive(Debug, Clone)]
pub struct HeaderState {
    rtp_seq: u16,
    rtp_timestamp: u32,
    rtp_ssrc: u32,
    quic_pn: u32,
}

impl HeaderState {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            rtp_seq: rng.gen(),
            rtp_timestamp: rng.gen(),
            rtp_ssrc: rng.gen(),
            quic_pn: rng.gen(),
        }
    }

    /// Prepend the header selected by `mode` to `payload`
    pub fn apply<R: RngCore + ?Sized>(
        &mut self,
        rng: &mut R,
        mode: HeaderMode,
        payload: &[u8],
        profile: Option<TrafficProfile>,
    ) -> Vec<u8> {
        match mode {
            HeaderMode::None => payload.to_vec(),
            HeaderMode::RtpLike => self.rtp_like(rng, payload, profile),
            HeaderMode::QuicLike => self.quic_like(rng, payload),
        }
    }

    /// 12-byte RTP fixed header: V=2, no padding/extension/CSRC
    fn rtp_like<R: RngCore + ?Sized>(&mut self, rng: &mut R, payload: &[u8], profile: Option<TrafficProfile>) -> Vec<u8> {
        let marker = u8::from(rng.gen_bool(0.02));
        let payload_type: u8 = match profile {
            Some(TrafficProfile::Voip) => 111,
            Some(TrafficProfile::Video) => 96,
            // dynamic range
            _ => rng.gen_range(96..=127),
        };

        self.rtp_seq = self.rtp_seq.wrapping_add(1);
        self.rtp_timestamp = self.rtp_timestamp.wrapping_add(rng.gen_range(800..=2000));

        let mut out = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
        out.push(RTP_VERSION << 6);
        out.push((marker << 7) | (payload_type & 0x7F));
        // writes into a Vec cannot fail
        let _ = out.write_u16::<BigEndian>(self.rtp_seq);
        let _ = out.write_u32::<BigEndian>(self.rtp_timestamp);
        let _ = out.write_u32::<BigEndian>(self.rtp_ssrc);
        out.extend_from_slice(payload);
        out
    }

    /// Long-header shaped bytes: flags, DCID, SCID, truncated packet number
    fn quic_like<R: RngCore + ?Sized>(&mut self, rng: &mut R, payload: &[u8]) -> Vec<u8> {
        let flags = 0xC0 | (rng.gen_range(0u8..4) << 4);
        let dcid_len = *[8usize, 12, 16].choose(rng).unwrap_or(&8);
        let scid_len = *[0usize, 8, 12].choose(rng).unwrap_or(&0);
        let pn_len = rng.gen_range(1usize..=4);

        self.quic_pn = self.quic_pn.wrapping_add(1);
        let pn_bytes = self.quic_pn.to_be_bytes();

        let mut out = Vec::with_capacity(3 + dcid_len + scid_len + pn_len + payload.len());
        out.push(flags);
        out.push(dcid_len as u8);
        let start = out.len();
        out.resize(start + dcid_len, 0);
        rng.fill_bytes(&mut out[start..]);
        out.push(scid_len as u8);
        let start = out.len();
        out.resize(start + scid_len, 0);
        rng.fill_bytes(&mut out[start..]);
        out.extend_from_slice(&pn_bytes[4 - pn_len..]);
        out.extend_from_slice(payload);
        out
    }

    pub fn rtp_seq(&self) -> u16 {
        self.rtp_seq
    }

    pub fn quic_pn(&self) -> u32 {
        self.quic_pn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Cursor;

    #[test]
    fn test_rtp_header_layout() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut state = HeaderState::new(&mut rng);
        let first_seq = state.rtp_seq();

        let pkt = state.apply(&mut rng, HeaderMode::RtpLike, b"hello", Some(TrafficProfile::Voip));
        assert_eq!(pkt.len(), RTP_HEADER_LEN + 5);
        assert_eq!(pkt[0] >> 6, 2);
        assert_eq!(pkt[1] & 0x7F, 111);
        assert_eq!(&pkt[RTP_HEADER_LEN..], b"hello");

        let mut cursor = Cursor::new(&pkt[2..]);
        let seq = cursor.read_u16::<BigEndian>().unwrap();
        assert_eq!(seq, first_seq.wrapping_add(1));
    }

    #[test]
    fn test_rtp_sequence_and_timestamp_advance() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut state = HeaderState::new(&mut rng);
        let a = state.apply(&mut rng, HeaderMode::RtpLike, &[], Some(TrafficProfile::Video));
        let b = state.apply(&mut rng, HeaderMode::RtpLike, &[], Some(TrafficProfile::Video));

        let read = |p: &[u8]| {
            let mut c = Cursor::new(&p[2..]);
            let seq = c.read_u16::<BigEndian>().unwrap();
            let ts = c.read_u32::<BigEndian>().unwrap();
            let ssrc = c.read_u32::<BigEndian>().unwrap();
            (seq, ts, ssrc)
        };
        let (seq_a, ts_a, ssrc_a) = read(&a);
        let (seq_b, ts_b, ssrc_b) = read(&b);
        assert_eq!(seq_b, seq_a.wrapping_add(1));
        let step = ts_b.wrapping_sub(ts_a);
        assert!((800..=2000).contains(&step));
        assert_eq!(ssrc_a, ssrc_b);
        assert_eq!(a[1] & 0x7F, 96);
    }

    #[test]
    fn test_quic_header_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = HeaderState::new(&mut rng);
        for _ in 0..100 {
            let pkt = state.apply(&mut rng, HeaderMode::QuicLike, &[0xAB; 10], None);
            assert_eq!(pkt[0] & 0xC0, 0xC0);
            let dcid_len = pkt[1] as usize;
            assert!([8, 12, 16].contains(&dcid_len));
            let scid_len = pkt[2 + dcid_len] as usize;
            assert!([0, 8, 12].contains(&scid_len));
            let header_len = pkt.len() - 10;
            let pn_len = header_len - 3 - dcid_len - scid_len;
            assert!((1..=4).contains(&pn_len));
            assert_eq!(&pkt[header_len..], &[0xAB; 10]);
        }
    }

    #[test]
    fn test_none_is_identity() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut state = HeaderState::new(&mut rng);
        assert_eq!(state.apply(&mut rng, HeaderMode::None, b"abc", None), b"abc".to_vec());
    }

    #[test]
    fn test_header_names() {
        assert_eq!(HeaderMode::from_str("rtp", true).unwrap(), HeaderMode::RtpLike);
        assert_eq!(HeaderMode::from_str("quic_like", true).unwrap(), HeaderMode::QuicLike);
        let parsed: HeaderMode = serde_yaml::from_str("rtp_like").unwrap();
        assert_eq!(parsed, HeaderMode::RtpLike);
    }
}
