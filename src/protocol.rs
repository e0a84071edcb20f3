//! Wire formats exchanged between the masking server and its clients
//!
//! Control packets are bare ASCII literals. Data packets in legacy mode carry
//! a sequence number, a microsecond timestamp and an MD5 checksum; client
//! response packets carry a type byte, sequence number and timestamp. All
//! integers are big-endian.

use anyhow::anyhow;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use md5::{Digest, Md5};
use std::io::{Cursor, Read};
use thiserror::Error;

/// Errors raised while decoding packets off the wire.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Underlying IO error from reading or writing packet data.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Packet is shorter than its fixed header.
    #[error("Packet truncated: need at least {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    /// First byte does not name a known packet type.
    #[error("Invalid packet type: 0x{0:02x}")]
    InvalidType(u8),
    /// Legacy checksum does not cover the received bytes.
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}

/// Registration literal sent by a client on connect
pub const INIT_CLIENT: &[u8] = b"INIT_CLIENT";
/// Liveness literal sent periodically by a client
pub const KEEPALIVE: &[u8] = b"KEEPALIVE";

/// sequence (4) + timestamp (8) + md5 (16)
pub const LEGACY_HEADER_LEN: usize = 28;
/// type (1) + sequence (4) + timestamp (8)
pub const RESPONSE_HEADER_LEN: usize = 13;
/// Largest datagram either endpoint reads
pub const MAX_DATAGRAM: usize = 65536;

/// Typed packets identified by their first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Client uplink traffic
    Response = 0x02,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(PacketType::Response),
            _ => Err(anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

/// Control literals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    InitClient,
    Keepalive,
}

impl ControlMessage {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            ControlMessage::InitClient => INIT_CLIENT,
            ControlMessage::Keepalive => KEEPALIVE,
        }
    }

    /// Match a datagram against the control literals exactly
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data == INIT_CLIENT {
            Some(ControlMessage::InitClient)
        } else if data == KEEPALIVE {
            Some(ControlMessage::Keepalive)
        } else {
            None
        }
    }
}

/// What the server makes of an inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Response(ResponsePacket),
    /// Anything else still counts as liveness
    Opaque(usize),
}

impl Inbound {
    pub fn classify(data: &[u8]) -> Self {
        if let Some(control) = ControlMessage::parse(data) {
            return Inbound::Control(control);
        }
        match ResponsePacket::from_bytes(data) {
            Ok(packet) => Inbound::Response(packet),
            Err(_) => Inbound::Opaque(data.len()),
        }
    }
}

/// Server data packet used when the obfuscation pipeline is off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyDataPacket {
    pub sequence: u32,
    pub timestamp_us: u64,
    pub checksum: [u8; 16],
    pub payload: Vec<u8>,
}

impl LegacyDataPacket {
    /// Build a packet and compute its checksum
    pub fn new(sequence: u32, timestamp_us: u64, payload: Vec<u8>) -> Self {
        let checksum = legacy_checksum(sequence, timestamp_us, &payload);
        Self {
            sequence,
            timestamp_us,
            checksum,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        LEGACY_HEADER_LEN + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        // writes into a Vec cannot fail
        let _ = buf.write_u32::<BigEndian>(self.sequence);
        let _ = buf.write_u64::<BigEndian>(self.timestamp_us);
        buf.extend_from_slice(&self.checksum);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode without checking the checksum; see [`verify`](Self::verify)
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < LEGACY_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: LEGACY_HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let sequence = cursor.read_u32::<BigEndian>()?;
        let timestamp_us = cursor.read_u64::<BigEndian>()?;
        let mut checksum = [0u8; 16];
        cursor.read_exact(&mut checksum)?;
        let payload = data[LEGACY_HEADER_LEN..].to_vec();
        Ok(Self {
            sequence,
            timestamp_us,
            checksum,
            payload,
        })
    }

    pub fn verify(&self) -> Result<(), ProtocolError> {
        if legacy_checksum(self.sequence, self.timestamp_us, &self.payload) == self.checksum {
            Ok(())
        } else {
            Err(ProtocolError::ChecksumMismatch)
        }
    }
}

/// MD5 over `sequence || timestamp || payload`
pub fn legacy_checksum(sequence: u32, timestamp_us: u64, payload: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(sequence.to_be_bytes());
    hasher.update(timestamp_us.to_be_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

/// Client uplink packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub sequence: u32,
    pub timestamp_us: u64,
    pub payload: Vec<u8>,
}

impl ResponsePacket {
    pub fn new(sequence: u32, timestamp_us: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            timestamp_us,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RESPONSE_HEADER_LEN + self.payload.len());
        buf.push(PacketType::Response as u8);
        let _ = buf.write_u32::<BigEndian>(self.sequence);
        let _ = buf.write_u64::<BigEndian>(self.timestamp_us);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: RESPONSE_HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let kind = cursor.read_u8()?;
        PacketType::try_from(kind).map_err(|_| ProtocolError::InvalidType(kind))?;
        let sequence = cursor.read_u32::<BigEndian>()?;
        let timestamp_us = cursor.read_u64::<BigEndian>()?;
        Ok(Self {
            sequence,
            timestamp_us,
            payload: data[RESPONSE_HEADER_LEN..].to_vec(),
        })
    }
}

/// Microseconds since the Unix epoch, zero if the clock is before it
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::try_from(0x02).unwrap(), PacketType::Response);
        assert!(PacketType::try_from(0x01).is_err());
    }

    #[test]
    fn test_control_literals() {
        assert_eq!(ControlMessage::parse(b"INIT_CLIENT"), Some(ControlMessage::InitClient));
        assert_eq!(ControlMessage::parse(b"KEEPALIVE"), Some(ControlMessage::Keepalive));
        assert_eq!(ControlMessage::parse(b"KEEPALIVE\n"), None);
        assert_eq!(ControlMessage::Keepalive.as_bytes(), KEEPALIVE);
    }

    #[test]
    fn test_legacy_layout() {
        let packet = LegacyDataPacket::new(7, 0x0102_0304_0506_0708, vec![0xAA; 4]);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), LEGACY_HEADER_LEN + 4);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 7]);
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[12..28], &legacy_checksum(7, 0x0102_0304_0506_0708, &[0xAA; 4]));

        let parsed = LegacyDataPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert!(parsed.verify().is_ok());
    }

    #[test]
    fn test_legacy_checksum_detects_tampering() {
        let mut bytes = LegacyDataPacket::new(1, 2, vec![3; 100]).to_bytes();
        bytes[50] ^= 0xFF;
        let parsed = LegacyDataPacket::from_bytes(&bytes).unwrap();
        assert!(matches!(parsed.verify(), Err(ProtocolError::ChecksumMismatch)));
    }

    #[test]
    fn test_legacy_truncated() {
        let err = LegacyDataPacket::from_bytes(&[0u8; 27]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 28, actual: 27 }));
    }

    #[test]
    fn test_response_layout() {
        let packet = ResponsePacket::new(9, 10, b"hello".to_vec());
        let bytes = packet.to_bytes();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes.len(), RESPONSE_HEADER_LEN + 5);
        assert_eq!(ResponsePacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_response_rejects_wrong_type() {
        let mut bytes = ResponsePacket::new(1, 1, vec![]).to_bytes();
        bytes[0] = 0x05;
        assert!(matches!(
            ResponsePacket::from_bytes(&bytes),
            Err(ProtocolError::InvalidType(0x05))
        ));
    }

    #[test]
    fn test_classify() {
        assert_eq!(Inbound::classify(INIT_CLIENT), Inbound::Control(ControlMessage::InitClient));
        let response = ResponsePacket::new(3, 4, vec![1, 2]);
        assert_eq!(Inbound::classify(&response.to_bytes()), Inbound::Response(response));
        assert_eq!(Inbound::classify(&[0xFF; 40]), Inbound::Opaque(40));
    }

    proptest! {
        #[test]
        fn test_parsers_never_panic(data in prop::collection::vec(any::<u8>(), 0..1000)) {
            let _ = LegacyDataPacket::from_bytes(&data);
            let _ = ResponsePacket::from_bytes(&data);
            let _ = Inbound::classify(&data);
        }

        #[test]
        fn test_legacy_roundtrip_verifies(
            sequence in any::<u32>(),
            timestamp_us in any::<u64>(),
            payload in prop::collection::vec(any::<u8>(), 0..1400)
        ) {
            let bytes = LegacyDataPacket::new(sequence, timestamp_us, payload.clone()).to_bytes();
            let parsed = LegacyDataPacket::from_bytes(&bytes).expect("parse failed");
            prop_assert!(parsed.verify().is_ok());
            prop_assert_eq!(parsed.payload, payload);
        }
    }
}
