//! Named hash calculations over packet fields.
//!
//! A calculation serializes its input fields (in declaration order, each
//! big-endian in `ceil(width / 8)` bytes) and runs one of the standard
//! switch hash algorithms over the resulting byte string.

use super::phv::Packet;
use super::DeviceError;
use serde::Deserialize;
use std::fmt;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Input bytes read as a big-endian integer (low 64 bits kept).
    Identity,
    /// CRC-16/ARC (poly 0x8005, reflected, init 0).
    Crc16,
    /// CRC-32/ISO-HDLC (poly 0x04C11DB7, reflected, init/xorout 0xFFFFFFFF).
    Crc32,
    /// XOR of 16-bit big-endian words.
    Xor16,
    /// Internet checksum (ones' complement sum of 16-bit words).
    Csum16,
}

impl HashAlgorithm {
    /// Run the algorithm over `bytes`.
    pub fn compute(self, bytes: &[u8]) -> u64 {
        match self {
            HashAlgorithm::Identity => bytes
                .iter()
                .fold(0u64, |acc, &b| (acc << 8) | b as u64),
            HashAlgorithm::Crc16 => crc16_arc(bytes) as u64,
            HashAlgorithm::Crc32 => crc32(bytes) as u64,
            HashAlgorithm::Xor16 => words16(bytes).fold(0u16, |acc, w| acc ^ w) as u64,
            HashAlgorithm::Csum16 => {
                let mut sum: u32 = 0;
                for w in words16(bytes) {
                    sum += w as u32;
                    sum = (sum & 0xFFFF) + (sum >> 16);
                }
                (!(sum as u16)) as u64
            }
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Identity => "identity",
            HashAlgorithm::Crc16 => "crc16",
            HashAlgorithm::Crc32 => "crc32",
            HashAlgorithm::Xor16 => "xor16",
            HashAlgorithm::Csum16 => "csum16",
        };
        f.write_str(name)
    }
}

/// 16-bit big-endian words, zero-padding an odd trailing byte.
fn words16(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes.chunks(2).map(|c| {
        let hi = c[0] as u16;
        let lo = c.get(1).copied().unwrap_or(0) as u16;
        (hi << 8) | lo
    })
}

fn crc16_arc(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in bytes {
        crc ^= b as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
    }
    crc
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in bytes {
        crc ^= b as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
        }
    }
    !crc
}

/// A named hash calculation, as referenced by `execute_stateful_alu_from_hash`.
#[derive(Debug, Clone)]
pub struct NamedCalculation {
    name: String,
    algorithm: HashAlgorithm,
    fields: Vec<String>,
}

impl NamedCalculation {
    /// Create a calculation over `fields`.
    pub fn new(name: impl Into<String>, algorithm: HashAlgorithm, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            algorithm,
            fields,
        }
    }

    /// Calculation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input field names.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Compute the hash of `packet`.
    pub fn output(&self, packet: &Packet) -> Result<u64, DeviceError> {
        let mut bytes = Vec::with_capacity(self.fields.len() * 4);
        for name in &self.fields {
            let width = packet
                .phv
                .layout()
                .field(name)
                .map(|f| f.bitwidth)
                .ok_or_else(|| DeviceError::UnknownField(name.clone()))?;
            let value = packet.phv.get(name)?;
            let nbytes = width.div_ceil(8);
            bytes.extend_from_slice(&value.to_be_bytes()[8 - nbytes..]);
        }
        Ok(self.algorithm.compute(&bytes))
    }
}
