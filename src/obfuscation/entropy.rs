// Entropy enhancer
//
// Generates payload bytes whose entropy and byte-level structure resemble a
// chosen kind of encrypted content, then runs them through a simulated
// stream, block or AEAD cipher.

use super::sampling::weighted_index;
use super::ObfuscationError;
use byteorder::{BigEndian, WriteBytesExt};
use md5::{Digest as _, Md5};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, HashSet, VecDeque};

const BLOCK_SIZE: usize = 16;
const AEAD_TAG: usize = 16;
const SRTP_TAG: usize = 10;
const MAX_MEASUREMENTS: usize = 1000;
const MAX_CACHE_ENTRIES: usize = 4096;

/// Kind of encrypted content to imitate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    CompressedVideo,
    CompressedAudio,
    TlsRecord,
    WebrtcSrtp,
    QuicPacket,
    SshPacket,
    Mixed,
}

/// Cipher family whose output characteristics are simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherType {
    Stream,
    Block,
    Aead,
}

impl CipherType {
    pub const ALL: [CipherType; 3] = [CipherType::Stream, CipherType::Block, CipherType::Aead];
}

/// Coarse entropy grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntropyQuality {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl EntropyQuality {
    pub fn classify(entropy: f64) -> Self {
        if entropy < 0.5 {
            EntropyQuality::VeryLow
        } else if entropy < 0.7 {
            EntropyQuality::Low
        } else if entropy < 0.9 {
            EntropyQuality::Medium
        } else if entropy < 0.95 {
            EntropyQuality::High
        } else {
            EntropyQuality::VeryHigh
        }
    }
}

/// Structural hints found in a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadPattern {
    TlsLike,
    HighNullBytes,
    /// An immediately repeated run of this many bytes
    Repeat(usize),
}

/// Result of [`EntropyEnhancer::analyze_payload_characteristics`]
#[derive(Debug, Clone, Serialize)]
pub struct PayloadCharacteristics {
    pub size: usize,
    pub entropy: f64,
    pub entropy_quality: EntropyQuality,
    /// Up to five `(byte, count)` pairs, most frequent first
    pub most_common_bytes: Vec<(u8, usize)>,
    pub chi_square: f64,
    pub randomness_good: bool,
    pub repeated_blocks: usize,
    pub block_cipher_likely: bool,
    pub patterns: Vec<PayloadPattern>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntropyStatistics {
    pub generated_bytes: u64,
    pub cache_size: usize,
    pub measurements: usize,
    pub avg_entropy: Option<f64>,
    pub min_entropy: Option<f64>,
    pub max_entropy: Option<f64>,
}

/// Generator of encrypted-looking payloads
pub struct EntropyEnhancer {
    stream_state: [u8; 32],
    block_counter: u64,
    entropy_cache: HashMap<[u8; 16], f64>,
    measurements: VecDeque<f64>,
    generated_bytes: u64,
    rng: StdRng,
}

impl EntropyEnhancer {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(mut rng: StdRng) -> Self {
        let mut stream_state = [0u8; 32];
        rng.fill_bytes(&mut stream_state);
        Self {
            stream_state,
            block_counter: 0,
            entropy_cache: HashMap::new(),
            measurements: VecDeque::with_capacity(MAX_MEASUREMENTS),
            generated_bytes: 0,
            rng,
        }
    }

    /// Payload of exactly `size` bytes imitating `content_type`
    ///
    /// # Arguments
    ///
    /// * `size` - Output length in bytes
    /// * `content_type` - Content whose structure is imitated
    /// * `cipher` - Cipher simulation; chosen from the content type when `None`
    pub fn generate_realistic_encrypted_payload(
        &mut self,
        size: usize,
        content_type: ContentType,
        cipher: Option<CipherType>,
    ) -> Vec<u8> {
        if size == 0 {
            return Vec::new();
        }
        let cipher = cipher.unwrap_or_else(|| self.select_cipher(content_type));

        let mut payload = match content_type {
            ContentType::CompressedVideo => self.video_payload(size),
            ContentType::CompressedAudio => self.audio_payload(size),
            ContentType::TlsRecord => self.tls_payload(size),
            ContentType::WebrtcSrtp => self.srtp_payload(size),
            ContentType::QuicPacket => self.quic_payload(size),
            ContentType::SshPacket => self.ssh_payload(size),
            ContentType::Mixed => self.mixed_payload(size),
        };
        self.fit(&mut payload, size);

        let mut out = self.apply_cipher(payload, cipher);
        self.fit(&mut out, size);
        self.generated_bytes += out.len() as u64;
        out
    }

    fn select_cipher(&mut self, content_type: ContentType) -> CipherType {
        match content_type {
            ContentType::TlsRecord | ContentType::QuicPacket => CipherType::Aead,
            ContentType::WebrtcSrtp | ContentType::CompressedVideo | ContentType::CompressedAudio => {
                CipherType::Stream
            }
            ContentType::SshPacket => CipherType::Block,
            ContentType::Mixed => *CipherType::ALL.choose(&mut self.rng).unwrap_or(&CipherType::Aead),
        }
    }

    fn random_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.rng.fill_bytes(&mut buf);
        buf
    }

    /// Truncate or top up with random bytes to exactly `size`
    fn fit(&mut self, buf: &mut Vec<u8>, size: usize) {
        if buf.len() > size {
            buf.truncate(size);
        } else if buf.len() < size {
            let extra = self.random_bytes(size - buf.len());
            buf.extend_from_slice(&extra);
        }
    }

    fn video_payload(&mut self, size: usize) -> Vec<u8> {
        let header_len = (size / 10).min(32);
        let mut out = Vec::with_capacity(size);
        for _ in 0..header_len {
            let b = if self.rng.gen_bool(0.3) {
                *[0x00, 0x01, 0x41, 0x61].choose(&mut self.rng).unwrap_or(&0x00)
            } else {
                self.rng.gen_range(0x20..=0x7F)
            };
            out.push(b);
        }

        let mut remaining = size - header_len;
        while remaining > 0 {
            let nal_size = remaining.min(*[188usize, 1316, 1400].choose(&mut self.rng).unwrap_or(&188));
            // I, P and B frames
            let nal = match weighted_index(&mut self.rng, &[0.1, 0.6, 0.3]) {
                0 if self.rng.gen_bool(0.3) => {
                    // repeated macroblocks
                    let pattern = self.random_bytes(16);
                    let mut nal = Vec::with_capacity(nal_size);
                    for _ in 0..nal_size / 16 {
                        if self.rng.gen_bool(0.7) {
                            nal.extend_from_slice(&pattern);
                        } else {
                            let block = self.random_bytes(16);
                            nal.extend_from_slice(&block);
                        }
                    }
                    let tail = self.random_bytes(nal_size % 16);
                    nal.extend_from_slice(&tail);
                    nal
                }
                1 => {
                    let mut nal = self.random_bytes(nal_size);
                    let limit = nal_size.saturating_sub(4).min(100);
                    for i in (0..limit).step_by(20) {
                        nal[i..i + 3].copy_from_slice(&[0x00, 0x00, 0x01]);
                    }
                    nal
                }
                _ => self.random_bytes(nal_size),
            };
            out.extend_from_slice(&nal);
            remaining -= nal_size;
        }
        out
    }

    fn audio_payload(&mut self, size: usize) -> Vec<u8> {
        const OPUS: [usize; 3] = [20, 40, 60];
        const AAC: [usize; 3] = [128, 256, 512];
        const MP3: [usize; 3] = [144, 288, 576];
        let codec = [OPUS, AAC, MP3][self.rng.gen_range(0..3)];
        let frame_size = codec[self.rng.gen_range(0..3)];

        let voice = self.random_bytes(frame_size);
        let mut out = Vec::with_capacity(size + frame_size);
        while out.len() < size {
            if self.rng.gen_bool(0.7) {
                let mut frame = voice.clone();
                for _ in 0..frame.len().min(10) {
                    let idx = self.rng.gen_range(0..frame.len());
                    frame[idx] ^= self.rng.gen_range(1..=255u8);
                }
                out.extend_from_slice(&frame);
            } else if self.rng.gen_bool(0.5) {
                let level = self.rng.gen_range(0..=15u8);
                out.extend(std::iter::repeat(level).take(frame_size));
            } else {
                let noise = self.random_bytes(frame_size);
                out.extend_from_slice(&noise);
            }
        }
        out.truncate(size);
        out
    }

    fn tls_payload(&mut self, size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(size + 5);
        while out.len() < size {
            let remaining = size - out.len();
            let variable = self.rng.gen_range(100..=1400);
            let record = *[16384usize, 8192, 4096, 1024, variable]
                .choose(&mut self.rng)
                .unwrap_or(&variable);
            let content_len = remaining.min(record).min(16384 + 256);

            // application data, legacy version 0x0303
            out.push(0x17);
            out.extend_from_slice(&[0x03, 0x03]);
            let _ = out.write_u16::<BigEndian>(content_len as u16);
            let body = self.random_bytes(content_len);
            out.extend_from_slice(&body);
        }
        out.truncate(size);
        out
    }

    fn srtp_payload(&mut self, size: usize) -> Vec<u8> {
        if size < 12 + SRTP_TAG {
            return self.random_bytes(size);
        }

        let extension = self.rng.gen_bool(0.5);
        let marker = self.rng.gen_bool(0.5);
        let payload_type = *[111u8, 96, 97, 98].choose(&mut self.rng).unwrap_or(&111);

        let mut out = Vec::with_capacity(size);
        out.push((2 << 6) | (u8::from(extension) << 4));
        out.push((u8::from(marker) << 7) | payload_type);
        let _ = out.write_u16::<BigEndian>(self.rng.gen());
        let _ = out.write_u32::<BigEndian>(self.rng.gen());
        let _ = out.write_u32::<BigEndian>(self.rng.gen());

        if extension {
            let words = self.rng.gen_range(1..=10u16);
            // only add the extension when it still leaves room for the tag
            if out.len() + 4 + words as usize * 4 + SRTP_TAG <= size {
                let _ = out.write_u16::<BigEndian>(self.rng.gen());
                let _ = out.write_u16::<BigEndian>(words);
                let data = self.random_bytes(words as usize * 4);
                out.extend_from_slice(&data);
            } else {
                out[0] &= !(1 << 4);
            }
        }

        let body = self.random_bytes(size - out.len() - SRTP_TAG);
        out.extend_from_slice(&body);
        let tag = self.random_bytes(SRTP_TAG);
        out.extend_from_slice(&tag);
        out
    }

    fn quic_payload(&mut self, size: usize) -> Vec<u8> {
        // short header, key phase 0
        let mut out = vec![0x40u8];
        let dcid_len = *[0usize, 8, 16].choose(&mut self.rng).unwrap_or(&8);
        let pn_len = self.rng.gen_range(1..=4);
        let header_rest = self.random_bytes(dcid_len + pn_len);
        out.extend_from_slice(&header_rest);
        let remaining = size.saturating_sub(out.len());
        let body = self.random_bytes(remaining);
        out.extend_from_slice(&body);
        out
    }

    fn ssh_payload(&mut self, size: usize) -> Vec<u8> {
        let mac_len = if self.rng.gen_bool(0.5) { 32 } else { 0 };
        let content = size.saturating_sub(mac_len).max(BLOCK_SIZE);
        let blocks = content.div_ceil(BLOCK_SIZE);

        let mut out: Vec<u8> = Vec::with_capacity(blocks * BLOCK_SIZE + mac_len);
        for i in 0..blocks {
            if i > 0 && self.rng.gen_bool(0.1) {
                // previous block folded with fresh noise, like a repeated command under CBC
                let noise = self.random_bytes(BLOCK_SIZE);
                let start = (i - 1) * BLOCK_SIZE;
                let chained: Vec<u8> = out[start..start + BLOCK_SIZE]
                    .iter()
                    .zip(noise.iter())
                    .map(|(a, b)| a ^ b)
                    .collect();
                out.extend_from_slice(&chained);
            } else {
                let block = self.random_bytes(BLOCK_SIZE);
                out.extend_from_slice(&block);
            }
        }
        if mac_len > 0 {
            out.truncate(content);
            let mac = self.random_bytes(mac_len);
            out.extend_from_slice(&mac);
        }
        out
    }

    fn mixed_payload(&mut self, size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let chunk_len = (size - out.len()).min(self.rng.gen_range(64..=1400));
            let chunk = match weighted_index(&mut self.rng, &[0.3, 0.3, 0.3, 0.1]) {
                // block aligned with PKCS#7 tail
                1 => {
                    let aligned = chunk_len / BLOCK_SIZE * BLOCK_SIZE;
                    let mut chunk = self.random_bytes(aligned);
                    let pad = chunk_len - aligned;
                    chunk.extend(std::iter::repeat(pad as u8).take(pad));
                    chunk
                }
                // TLS-like record
                3 if chunk_len > 5 => {
                    let mut chunk = Vec::with_capacity(chunk_len);
                    chunk.extend_from_slice(&[0x17, 0x03, 0x03]);
                    let _ = chunk.write_u16::<BigEndian>((chunk_len - 5) as u16);
                    let body = self.random_bytes(chunk_len - 5);
                    chunk.extend_from_slice(&body);
                    chunk
                }
                // stream and AEAD chunks are indistinguishable from noise
                _ => self.random_bytes(chunk_len),
            };
            out.extend_from_slice(&chunk);
        }
        out
    }

    fn apply_cipher(&mut self, payload: Vec<u8>, cipher: CipherType) -> Vec<u8> {
        match cipher {
            CipherType::Stream => {
                let keystream = self.keystream(payload.len());
                payload.iter().zip(keystream.iter()).map(|(a, b)| a ^ b).collect()
            }
            CipherType::Block => {
                let len = payload.len();
                let mut padded = payload;
                let pad = (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE;
                padded.extend(std::iter::repeat(pad as u8).take(pad));

                let mut out = Vec::with_capacity(padded.len());
                for block in padded.chunks(BLOCK_SIZE) {
                    let mut hasher = Md5::new();
                    if self.rng.gen_bool(0.05) {
                        // identical plaintext-independent block, the ECB tell
                        hasher.update(b"ecb");
                        hasher.update([(self.block_counter % 256) as u8]);
                    } else {
                        hasher.update(block);
                        hasher.update([(self.block_counter % 256) as u8]);
                    }
                    out.extend_from_slice(&hasher.finalize()[..BLOCK_SIZE]);
                    self.block_counter += 1;
                }
                out.truncate(len);
                out
            }
            CipherType::Aead => {
                if payload.len() > AEAD_TAG {
                    payload
                } else {
                    self.random_bytes(payload.len())
                }
            }
        }
    }

    /// SHA-256 chained keystream; the chain state persists across calls
    fn keystream(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len + 32);
        let mut state = self.stream_state;
        while out.len() < len {
            state = Sha256::digest(state).into();
            out.extend_from_slice(&state);
        }
        self.stream_state = state;
        out.truncate(len);
        out
    }

    /// Shannon entropy normalized to [0, 1]
    pub fn calculate_entropy(&mut self, data: &[u8]) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let key: [u8; 16] = Md5::digest(data).into();
        if let Some(cached) = self.entropy_cache.get(&key) {
            return *cached;
        }

        let normalized = shannon_bits_per_byte(data) / 8.0;

        if self.entropy_cache.len() >= MAX_CACHE_ENTRIES {
            self.entropy_cache.clear();
        }
        self.entropy_cache.insert(key, normalized);
        if self.measurements.len() == MAX_MEASUREMENTS {
            self.measurements.pop_front();
        }
        self.measurements.push_back(normalized);
        normalized
    }

    pub fn analyze_payload_characteristics(&mut self, payload: &[u8]) -> Result<PayloadCharacteristics, ObfuscationError> {
        if payload.is_empty() {
            return Err(ObfuscationError::EmptyPayload);
        }
        let entropy = self.calculate_entropy(payload);

        let mut counts = [0usize; 256];
        for &b in payload {
            counts[b as usize] += 1;
        }
        let mut most_common: Vec<(u8, usize)> = counts
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0)
            .map(|(b, c)| (b as u8, *c))
            .collect();
        most_common.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        most_common.truncate(5);

        let expected = payload.len() as f64 / 256.0;
        let chi_square: f64 = counts
            .iter()
            .filter(|c| **c > 0)
            .map(|&c| (c as f64 - expected).powi(2) / expected)
            .sum();

        let blocks: Vec<&[u8]> = payload.chunks_exact(BLOCK_SIZE).collect();
        let unique: HashSet<&[u8]> = blocks.iter().copied().collect();
        let repeated_blocks = blocks.len() - unique.len();

        Ok(PayloadCharacteristics {
            size: payload.len(),
            entropy,
            entropy_quality: EntropyQuality::classify(entropy),
            most_common_bytes: most_common,
            chi_square,
            randomness_good: chi_square < 300.0,
            repeated_blocks,
            block_cipher_likely: repeated_blocks > 2,
            patterns: detect_patterns(payload),
        })
    }

    pub fn statistics(&self) -> EntropyStatistics {
        let n = self.measurements.len();
        EntropyStatistics {
            generated_bytes: self.generated_bytes,
            cache_size: self.entropy_cache.len(),
            measurements: n,
            avg_entropy: (n > 0).then(|| self.measurements.iter().sum::<f64>() / n as f64),
            min_entropy: self.measurements.iter().copied().reduce(f64::min),
            max_entropy: self.measurements.iter().copied().reduce(f64::max),
        }
    }

    pub fn reset(&mut self) {
        self.rng.fill_bytes(&mut self.stream_state);
        self.block_counter = 0;
        self.entropy_cache.clear();
        self.measurements.clear();
        self.generated_bytes = 0;
    }
}

impl Default for EntropyEnhancer {
    fn default() -> Self {
        Self::new()
    }
}

/// Shannon entropy in bits per byte, in [0, 8]
pub fn shannon_bits_per_byte(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    let bits: f64 = counts
        .iter()
        .filter(|c| **c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum();
    bits.clamp(0.0, 8.0)
}

fn detect_patterns(data: &[u8]) -> Vec<PayloadPattern> {
    let mut patterns = Vec::new();
    if data.len() >= 5 && matches!(data[0], 0x14..=0x17) && data[1..3] == [0x03, 0x03] {
        patterns.push(PayloadPattern::TlsLike);
    }
    let nulls = data.iter().filter(|b| **b == 0).count();
    if nulls as f64 / data.len() as f64 > 0.1 {
        patterns.push(PayloadPattern::HighNullBytes);
    }
    for len in [2usize, 4, 8, 16] {
        if data.len() < len * 2 {
            continue;
        }
        let found = (0..data.len() - len * 2).any(|i| data[i..i + len] == data[i + len..i + 2 * len]);
        if found {
            patterns.push(PayloadPattern::Repeat(len));
        }
    }
    patterns
}
