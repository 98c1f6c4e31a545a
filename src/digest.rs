//! Header and data digests (RFC 3720 Section 12.1)
//!
//! CRC32C uses the Castagnoli polynomial. The lookup tables for the
//! slicing-by-4 loop are generated from the polynomial at compile time.
//!
//! [`Digest::value`] returns the checksum as it reads when the four digest
//! bytes on the wire are taken big-endian, so `value().to_be_bytes()` is
//! exactly what follows the header or the data segment.

use crate::error::{DigestKind, ProtocolError};

/// Castagnoli polynomial 0x1EDC6F41, bit-reflected
const CASTAGNOLI: u32 = 0x82F6_3B78;

/// Size of a digest on the wire
pub const DIGEST_SIZE: usize = 4;

static TABLES: [[u32; 256]; 4] = generate_tables(CASTAGNOLI);

/// Build the four slicing tables for a reflected polynomial
const fn generate_tables(poly: u32) -> [[u32; 256]; 4] {
    let mut tables = [[0u32; 256]; 4];

    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ poly } else { crc >> 1 };
            bit += 1;
        }
        tables[0][i] = crc;
        i += 1;
    }

    let mut t = 1;
    while t < 4 {
        let mut i = 0;
        while i < 256 {
            let prev = tables[t - 1][i];
            tables[t][i] = (prev >> 8) ^ tables[0][(prev & 0xFF) as usize];
            i += 1;
        }
        t += 1;
    }

    tables
}

/// Checksum over one or more byte ranges
pub trait Digest: Send {
    /// Feed more bytes
    fn update(&mut self, data: &[u8]);

    /// Current checksum
    fn value(&self) -> u32;

    /// Start over
    fn reset(&mut self);

    /// Bytes this digest occupies on the wire
    fn size(&self) -> usize;

    /// Compare a received digest against the computed one
    fn validate(&self, kind: DigestKind, received: u32) -> Result<(), ProtocolError> {
        let computed = self.value();
        if computed == received {
            Ok(())
        } else {
            Err(ProtocolError::DigestMismatch {
                kind,
                expected: received,
                computed,
            })
        }
    }
}

/// CRC32C, slicing-by-4
#[derive(Debug, Clone)]
pub struct Crc32cDigest {
    crc: u32,
}

impl Default for Crc32cDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32cDigest {
    pub fn new() -> Self {
        Crc32cDigest { crc: !0 }
    }

    /// One-shot checksum of a buffer
    pub fn checksum(data: &[u8]) -> u32 {
        let mut digest = Crc32cDigest::new();
        digest.update(data);
        digest.value()
    }
}

impl Digest for Crc32cDigest {
    fn update(&mut self, data: &[u8]) {
        let mut crc = self.crc;

        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            crc ^= u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            crc = TABLES[3][(crc & 0xFF) as usize]
                ^ TABLES[2][((crc >> 8) & 0xFF) as usize]
                ^ TABLES[1][((crc >> 16) & 0xFF) as usize]
                ^ TABLES[0][(crc >> 24) as usize];
        }
        for &b in chunks.remainder() {
            crc = TABLES[0][((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
        }

        self.crc = crc;
    }

    fn value(&self) -> u32 {
        (!self.crc).swap_bytes()
    }

    fn reset(&mut self) {
        self.crc = !0;
    }

    fn size(&self) -> usize {
        DIGEST_SIZE
    }
}

/// Digest used when none was negotiated
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDigest;

impl Digest for NullDigest {
    fn update(&mut self, _data: &[u8]) {}

    fn value(&self) -> u32 {
        0
    }

    fn reset(&mut self) {}

    fn size(&self) -> usize {
        0
    }

    fn validate(&self, _kind: DigestKind, _received: u32) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Negotiated digest for headers or data (HeaderDigest / DataDigest keys)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

impl DigestType {
    /// Fresh digest state of this type
    pub fn create(self) -> Box<dyn Digest> {
        match self {
            DigestType::None => Box::new(NullDigest),
            DigestType::CRC32C => Box::new(Crc32cDigest::new()),
        }
    }

    /// Bytes on the wire
    pub fn size(self) -> usize {
        match self {
            DigestType::None => 0,
            DigestType::CRC32C => DIGEST_SIZE,
        }
    }

    /// Digest over several ranges, or `None` when digests are off
    pub fn compute(self, parts: &[&[u8]]) -> Option<u32> {
        match self {
            DigestType::None => None,
            DigestType::CRC32C => {
                let mut digest = Crc32cDigest::new();
                for part in parts {
                    digest.update(part);
                }
                Some(digest.value())
            }
        }
    }

    /// Text key value
    pub fn as_str(self) -> &'static str {
        match self {
            DigestType::None => "None",
            DigestType::CRC32C => "CRC32C",
        }
    }

    /// Pick from an offered list such as `CRC32C,None`, preferring `local`
    pub fn select(offered: &str, local: DigestType) -> DigestType {
        let has = |name: &str| offered.split(',').any(|v| v.trim() == name);
        if has(local.as_str()) {
            local
        } else if has("None") {
            DigestType::None
        } else if has("CRC32C") {
            DigestType::CRC32C
        } else {
            DigestType::None
        }
    }
}
