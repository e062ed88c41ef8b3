use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use xxhash_rust::xxh3::Xxh3;

/// Sentinel asqn marking a record without a meaningful application sequence number.
pub const ASQN_IGNORE: i64 = -1;

/// A single journal entry.
///
/// `index` is assigned by the journal; `asqn` is supplied by the caller (or
/// [`ASQN_IGNORE`]); `checksum` covers `index`, `asqn` and `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
  pub index: i64,
  pub asqn: i64,
  pub checksum: u64,
  pub data: Vec<u8>,
}

impl JournalRecord {
  /// Builds a record and computes its checksum.
  pub fn new(index: i64, asqn: i64, data: impl Into<Vec<u8>>) -> Self {
    let data = data.into();
    let checksum = compute_checksum(index, asqn, &data);
    Self {
      index,
      asqn,
      checksum,
      data,
    }
  }

  /// Returns true if the record carries a real asqn.
  pub fn has_asqn(&self) -> bool {
    self.asqn != ASQN_IGNORE
  }

  /// Size of the record once framed on disk.
  pub fn frame_size(&self) -> u64 {
    frame_size(self.data.len())
  }

  pub(crate) fn verify_checksum(&self) -> Result<()> {
    let actual = compute_checksum(self.index, self.asqn, &self.data);
    if actual != self.checksum {
      return Err(Error::InvalidChecksum {
        index: self.index,
        expected: self.checksum,
        actual,
      });
    }
    Ok(())
  }
}

/// Computes the xxh3 checksum of a record's content.
pub fn compute_checksum(index: i64, asqn: i64, data: &[u8]) -> u64 {
  let mut hasher = Xxh3::new();
  hasher.update(&index.to_le_bytes());
  hasher.update(&asqn.to_le_bytes());
  hasher.update(data);
  hasher.digest()
}

pub(crate) fn frame_size(data_len: usize) -> u64 {
  FrameHeader::SIZE as u64 + data_len as u64
}

/// The exact binary layout of a record header on disk (32 bytes).
///
/// [Frame Length: 4]
/// [Checksum: 8]
/// [Index: 8]
/// [Asqn: 8]
/// [Data Length: 4]
///
/// A frame length of zero marks the end of the written region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
  pub frame_len: u32,
  pub checksum: u64,
  pub index: i64,
  pub asqn: i64,
  pub data_len: u32,
}

impl FrameHeader {
  pub const SIZE: usize = 4 + 8 + 8 + 8 + 4; // 32 bytes

  pub fn for_record(record: &JournalRecord) -> Self {
    Self {
      frame_len: record.frame_size() as u32,
      checksum: record.checksum,
      index: record.index,
      asqn: record.asqn,
      data_len: record.data.len() as u32,
    }
  }

  pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(self.frame_len)?;
    writer.write_u64::<LittleEndian>(self.checksum)?;
    writer.write_i64::<LittleEndian>(self.index)?;
    writer.write_i64::<LittleEndian>(self.asqn)?;
    writer.write_u32::<LittleEndian>(self.data_len)?;
    Ok(())
  }

  pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
    Ok(Self {
      frame_len: reader.read_u32::<LittleEndian>()?,
      checksum: reader.read_u64::<LittleEndian>()?,
      index: reader.read_i64::<LittleEndian>()?,
      asqn: reader.read_i64::<LittleEndian>()?,
      data_len: reader.read_u32::<LittleEndian>()?,
    })
  }

  /// Returns true for the zero-length end marker.
  pub fn is_end(&self) -> bool {
    self.frame_len == 0
  }

  /// Checks that the header is self-consistent and belongs at `expected_index`.
  pub fn validate(&self, expected_index: i64) -> std::result::Result<(), String> {
    if self.frame_len as u64 != frame_size(self.data_len as usize) {
      return Err(format!(
        "frame length {} does not match data length {}",
        self.frame_len, self.data_len
      ));
    }
    if self.index != expected_index {
      return Err(format!("expected index {}, found {}", expected_index, self.index));
    }
    Ok(())
  }

  pub fn into_record(self, data: Vec<u8>) -> JournalRecord {
    JournalRecord {
      index: self.index,
      asqn: self.asqn,
      checksum: self.checksum,
      data,
    }
  }
}

/// Frames a record into `writer`. Returns the number of bytes written.
pub(crate) fn write_record<W: Write>(writer: &mut W, record: &JournalRecord) -> io::Result<u64> {
  FrameHeader::for_record(record).write(writer)?;
  writer.write_all(&record.data)?;
  Ok(record.frame_size())
}

/// Result of decoding one frame out of an in-memory region.
#[derive(Debug)]
pub(crate) enum Decoded {
  /// A complete, valid record and the length of its frame.
  Record(JournalRecord, u64),
  /// No more records: the region is exhausted or zero-filled.
  End,
  /// A partial or damaged frame.
  Invalid(String),
}

/// Decodes the frame at the start of `buf`, expecting it to hold `expected_index`.
pub(crate) fn decode(buf: &[u8], expected_index: i64) -> Decoded {
  if buf.is_empty() {
    return Decoded::End;
  }
  if buf.len() < FrameHeader::SIZE {
    if buf.iter().all(|b| *b == 0) {
      return Decoded::End;
    }
    return Decoded::Invalid(format!("partial header of {} bytes", buf.len()));
  }

  let header = FrameHeader {
    frame_len: LittleEndian::read_u32(&buf[0..4]),
    checksum: LittleEndian::read_u64(&buf[4..12]),
    index: LittleEndian::read_i64(&buf[12..20]),
    asqn: LittleEndian::read_i64(&buf[20..28]),
    data_len: LittleEndian::read_u32(&buf[28..32]),
  };

  if header.is_end() {
    return Decoded::End;
  }
  if let Err(reason) = header.validate(expected_index) {
    return Decoded::Invalid(reason);
  }

  let end = header.frame_len as usize;
  if end > buf.len() {
    return Decoded::Invalid(format!(
      "frame of {} bytes truncated to {} bytes",
      header.frame_len,
      buf.len()
    ));
  }

  let data = &buf[FrameHeader::SIZE..end];
  let actual = compute_checksum(header.index, header.asqn, data);
  if actual != header.checksum {
    return Decoded::Invalid(format!(
      "checksum mismatch: expected {:#018x}, got {:#018x}",
      header.checksum, actual
    ));
  }

  Decoded::Record(header.into_record(data.to_vec()), header.frame_len as u64)
}
