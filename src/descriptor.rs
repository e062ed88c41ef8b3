use crate::error::{Error, Result};
use crate::record::ASQN_IGNORE;
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

const DESCRIPTOR_MAGIC: [u8; 4] = *b"SJRN";

/// Header written at offset 0 of every segment file (64 bytes).
///
/// [Magic: 4]
/// [Version: 1]
/// [Reserved: 3]
/// [Segment ID: 8]
/// [Base Index: 8]
/// [Max Segment Size: 8]
/// [Prior Asqn: 8] (ASQN_IGNORE if none)
/// [CRC32: 4]
/// [Reserved: 20]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentDescriptor {
  pub id: u64,
  /// Index of the first record stored in the segment.
  pub index: i64,
  pub max_segment_size: u64,
  /// Last real asqn appended before `index`. Survives compaction of the
  /// segments that carried it.
  pub prior_asqn: Option<i64>,
}

impl SegmentDescriptor {
  pub const SIZE: usize = 64;
  pub const VERSION: u8 = 1;

  const CRC_OFFSET: usize = 40;

  pub fn new(id: u64, index: i64, max_segment_size: u64, prior_asqn: Option<i64>) -> Self {
    Self {
      id,
      index,
      max_segment_size,
      prior_asqn,
    }
  }

  pub fn encode(&self) -> [u8; Self::SIZE] {
    let mut out = [0u8; Self::SIZE];
    out[0..4].copy_from_slice(&DESCRIPTOR_MAGIC);
    out[4] = Self::VERSION;
    LittleEndian::write_u64(&mut out[8..16], self.id);
    LittleEndian::write_i64(&mut out[16..24], self.index);
    LittleEndian::write_u64(&mut out[24..32], self.max_segment_size);
    LittleEndian::write_i64(&mut out[32..40], self.prior_asqn.unwrap_or(ASQN_IGNORE));

    let crc = checksum(&out[..Self::CRC_OFFSET]);
    LittleEndian::write_u32(&mut out[Self::CRC_OFFSET..Self::CRC_OFFSET + 4], crc);
    out
  }

  pub fn decode(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < Self::SIZE {
      return Err(Error::Corruption(format!(
        "Segment descriptor too short: expected {}, got {}",
        Self::SIZE,
        bytes.len()
      )));
    }
    if bytes[0..4] != DESCRIPTOR_MAGIC {
      return Err(Error::Corruption(format!(
        "Invalid segment descriptor magic: {:02X?}",
        &bytes[0..4]
      )));
    }
    if bytes[4] != Self::VERSION {
      return Err(Error::Corruption(format!(
        "Unsupported segment descriptor version: expected {}, got {}",
        Self::VERSION,
        bytes[4]
      )));
    }

    let stored = LittleEndian::read_u32(&bytes[Self::CRC_OFFSET..Self::CRC_OFFSET + 4]);
    let actual = checksum(&bytes[..Self::CRC_OFFSET]);
    if stored != actual {
      return Err(Error::Corruption(format!(
        "Segment descriptor checksum mismatch: expected {:#x}, got {:#x}",
        stored, actual
      )));
    }

    let descriptor = Self {
      id: LittleEndian::read_u64(&bytes[8..16]),
      index: LittleEndian::read_i64(&bytes[16..24]),
      max_segment_size: LittleEndian::read_u64(&bytes[24..32]),
      prior_asqn: Some(LittleEndian::read_i64(&bytes[32..40])).filter(|asqn| *asqn != ASQN_IGNORE),
    };
    if descriptor.index < 1 {
      return Err(Error::Corruption(format!(
        "Segment {} has invalid base index {}",
        descriptor.id, descriptor.index
      )));
    }
    Ok(descriptor)
  }
}

fn checksum(bytes: &[u8]) -> u32 {
  let mut hasher = Hasher::new();
  hasher.update(bytes);
  hasher.finalize()
}
