//! The 16-byte forensic packet carried by the invisible mark.
//!
//! Layout (big-endian):
//!   bytes 0..2   format version, literal 0x0001
//!   bytes 2..10  SHA-256(token id string), first 8 bytes
//!   bytes 10..14 SHA-256(campaign id string), first 4 bytes
//!   bytes 14..16 CRC-16/CCITT-FALSE over bytes 0..14
//!
//! Strict parsing tolerates up to 2 flipped bits in the version field and
//! requires the CRC. Fuzzy parsing widens the version tolerance to 4 bits
//! and skips the CRC entirely: lossy re-encoding routinely flips a few bits
//! inside the envelope while the overall pattern survives, and the fuzzy
//! index lookup absorbs the rest.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Packet size in bytes.
pub const PAYLOAD_LEN: usize = 16;
/// Packet size in bits, the watermark capacity consumed per repetition.
pub const PAYLOAD_BITS: usize = PAYLOAD_LEN * 8;
/// Wire format version.
pub const PAYLOAD_VERSION: u16 = 0x0001;

const STRICT_VERSION_TOLERANCE: u32 = 2;
const FUZZY_VERSION_TOLERANCE: u32 = 4;

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no xorout.
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// First `n` bytes of SHA-256 over a string, hex-rendered lower-case.
fn sha256_prefix_hex(input: &str, n: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..n])
}

/// Build the packet for a (token id, campaign id) pair.
pub fn build(token_id: &str, campaign_id: &str) -> [u8; PAYLOAD_LEN] {
    let token_digest = Sha256::digest(token_id.as_bytes());
    let campaign_digest = Sha256::digest(campaign_id.as_bytes());

    let mut packet = [0u8; PAYLOAD_LEN];
    packet[0..2].copy_from_slice(&PAYLOAD_VERSION.to_be_bytes());
    packet[2..10].copy_from_slice(&token_digest[..8]);
    packet[10..14].copy_from_slice(&campaign_digest[..4]);
    let crc = crc16_ccitt_false(&packet[..14]);
    packet[14..16].copy_from_slice(&crc.to_be_bytes());
    packet
}

/// A successfully parsed packet. The hash slices identify the token and
/// campaign in the forensic index; the raw ids are not recoverable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedPayload {
    /// Hex of bytes 2..10 (16 chars), the token hash slice.
    pub token_hash_hex: String,
    /// Hex of bytes 10..14 (8 chars), the campaign hash slice.
    pub campaign_hash_hex: String,
    /// True when the CRC validated (always true for strict parses).
    pub crc_ok: bool,
}

/// Strict parse: length, version within 2 bits of 0x0001, CRC must match.
pub fn parse_strict(bytes: &[u8]) -> Result<ParsedPayload> {
    let packet = check_length(bytes)?;
    check_version(packet, STRICT_VERSION_TOLERANCE)?;

    let expected = crc16_ccitt_false(&packet[..14]);
    let stored = u16::from_be_bytes([packet[14], packet[15]]);
    if expected != stored {
        return Err(Error::InvalidPayload(format!(
            "crc mismatch: stored {stored:#06x}, computed {expected:#06x}"
        )));
    }

    Ok(ParsedPayload {
        token_hash_hex: hex::encode(&packet[2..10]),
        campaign_hash_hex: hex::encode(&packet[10..14]),
        crc_ok: true,
    })
}

/// Fuzzy parse: length and a version field within 4 bits of 0x0001. The CRC
/// is deliberately not checked; `crc_ok` records whether it happened to
/// validate anyway.
pub fn parse_fuzzy(bytes: &[u8]) -> Result<ParsedPayload> {
    let packet = check_length(bytes)?;
    check_version(packet, FUZZY_VERSION_TOLERANCE)?;

    let crc_ok = crc16_ccitt_false(&packet[..14]) == u16::from_be_bytes([packet[14], packet[15]]);
    Ok(ParsedPayload {
        token_hash_hex: hex::encode(&packet[2..10]),
        campaign_hash_hex: hex::encode(&packet[10..14]),
        crc_ok,
    })
}

fn check_length(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() != PAYLOAD_LEN {
        return Err(Error::InvalidPayload(format!(
            "expected {PAYLOAD_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn check_version(packet: &[u8], tolerance: u32) -> Result<()> {
    let version = u16::from_be_bytes([packet[0], packet[1]]);
    let distance = (version ^ PAYLOAD_VERSION).count_ones();
    if distance > tolerance {
        return Err(Error::InvalidPayload(format!(
            "version field {version:#06x} is {distance} bits from {PAYLOAD_VERSION:#06x} (tolerance {tolerance})"
        )));
    }
    Ok(())
}

/// Expand bytes into bits, MSB-first within each byte.
pub fn bytes_to_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for &byte in bytes {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1);
        }
    }
    bits
}

/// Pack bits (MSB-first) back into bytes. The length must be a multiple of 8.
pub fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
    debug_assert_eq!(bits.len() % 8, 0);
    bits.chunks(8)
        .map(|chunk| chunk.iter().fold(0u8, |acc, &b| (acc << 1) | (b & 1)))
        .collect()
}

/// The overlay caption for a token: first 8 hex chars of SHA-256(token id),
/// paired with the recipient display name by the overlay renderer.
pub fn token_short_hash(token_id: &str) -> String {
    sha256_prefix_hex(token_id, 4)
}
