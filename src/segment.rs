use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::error;

use crate::config::JournalOptions;
use crate::descriptor::SegmentDescriptor;
use crate::error::{Error, Result};
use crate::record::{FrameHeader, JournalRecord, compute_checksum, write_record};
use crate::util;

struct SegmentWriter {
  file: BufWriter<File>,
  /// Bytes were handed to the OS since the last `fsync`.
  dirty: bool,
}

/// One segment file holding a contiguous run of records starting at the
/// descriptor's base index.
///
/// The segment is shared (via `Arc`) between the journal and its readers.
/// Only the active segment owns a writer; readers open their own handles and
/// never look past `confirmed_len`.
pub(crate) struct Segment {
  descriptor: SegmentDescriptor,
  path: PathBuf,
  /// Length of the file region holding complete, validated records
  /// (descriptor included).
  confirmed_len: AtomicU64,
  /// Index of the last record in the segment, `base - 1` when empty.
  last_index: AtomicI64,
  writer: Mutex<Option<SegmentWriter>>,
}

impl Segment {
  /// Creates a new segment file containing only the descriptor.
  pub fn create(path: PathBuf, descriptor: SegmentDescriptor) -> Result<Self> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    file.write_all(&descriptor.encode())?;
    file.sync_all()?;
    if let Some(dir) = path.parent() {
      util::sync_dir(dir)?;
    }

    Ok(Self::open(path, descriptor, SegmentDescriptor::SIZE as u64, descriptor.index - 1))
  }

  /// Wraps an existing, already validated segment file.
  pub fn open(path: PathBuf, descriptor: SegmentDescriptor, confirmed_len: u64, last_index: i64) -> Self {
    Self {
      descriptor,
      path,
      confirmed_len: AtomicU64::new(confirmed_len),
      last_index: AtomicI64::new(last_index),
      writer: Mutex::new(None),
    }
  }

  pub fn id(&self) -> u64 {
    self.descriptor.id
  }

  pub fn base_index(&self) -> i64 {
    self.descriptor.index
  }

  pub fn last_index(&self) -> i64 {
    self.last_index.load(Ordering::Acquire)
  }

  /// Last real asqn appended before this segment's base index.
  pub fn prior_asqn(&self) -> Option<i64> {
    self.descriptor.prior_asqn
  }

  pub fn confirmed_len(&self) -> u64 {
    self.confirmed_len.load(Ordering::Acquire)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Returns true if a frame of `frame_size` bytes still fits in the segment.
  pub fn has_room_for(&self, frame_size: u64) -> bool {
    self.confirmed_len() + frame_size <= self.descriptor.max_segment_size
  }

  /// Opens the append handle, making this segment writable.
  pub fn activate(&self, options: &JournalOptions) -> Result<()> {
    let mut writer = self.writer.lock();
    if writer.is_none() {
      *writer = Some(self.open_writer(options.write_buffer_size)?);
    }
    Ok(())
  }

  fn open_writer(&self, buffer_size: usize) -> Result<SegmentWriter> {
    let file = OpenOptions::new().append(true).open(&self.path)?;

    // Anything past the confirmed length is an incomplete write; never append after it.
    let confirmed = self.confirmed_len();
    if file.metadata()?.len() != confirmed {
      file.set_len(confirmed)?;
    }

    Ok(SegmentWriter {
      file: BufWriter::with_capacity(buffer_size, file),
      dirty: false,
    })
  }

  /// Appends a framed record and hands it to the OS. Returns the frame's offset.
  ///
  /// The caller guarantees `record.index == last_index + 1` and that the
  /// frame fits.
  pub fn append(&self, record: &JournalRecord) -> Result<u64> {
    let mut guard = self.writer.lock();
    let writer = guard
      .as_mut()
      .ok_or_else(|| Error::Corruption(format!("Segment {} is not writable", self.id())))?;

    let offset = self.confirmed_len();
    let result = write_record(&mut writer.file, record).and_then(|len| writer.file.flush().map(|_| len));

    match result {
      Ok(len) => {
        writer.dirty = true;
        self.confirmed_len.store(offset + len, Ordering::Release);
        self.last_index.store(record.index, Ordering::Release);
        Ok(offset)
      }
      Err(e) => {
        // Discard whatever part of the frame reached the file so the next
        // append starts at a frame boundary again.
        let buffer_size = writer.file.capacity();
        *guard = None;
        match self.open_writer(buffer_size) {
          Ok(writer) => *guard = Some(writer),
          Err(reopen) => {
            error!(target: "segjournal", "Failed to reopen segment {} after a failed append: {}", self.id(), reopen);
          }
        }
        Err(Error::Io(e))
      }
    }
  }

  /// Forces buffered writes to stable storage.
  pub fn flush(&self) -> Result<()> {
    let mut guard = self.writer.lock();
    if let Some(writer) = guard.as_mut() {
      writer.file.flush()?;
      if writer.dirty {
        writer.file.get_ref().sync_data()?;
        writer.dirty = false;
      }
    }
    Ok(())
  }

  /// Flushes and releases the append handle. The segment stays readable.
  pub fn seal(&self) -> Result<()> {
    self.flush()?;
    *self.writer.lock() = None;
    Ok(())
  }

  /// Drops every record after `last_index`, whose frame ends at `offset`.
  pub fn truncate(&self, offset: u64, last_index: i64) -> Result<()> {
    let mut guard = self.writer.lock();
    match guard.as_mut() {
      Some(writer) => {
        writer.file.flush()?;
        writer.file.get_ref().set_len(offset)?;
        writer.file.get_ref().sync_all()?;
        writer.dirty = false;
      }
      None => {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(offset)?;
        file.sync_all()?;
      }
    }

    self.confirmed_len.store(offset, Ordering::Release);
    self.last_index.store(last_index, Ordering::Release);
    Ok(())
  }

  /// Releases the writer and removes the file.
  pub fn delete(&self) -> io::Result<()> {
    *self.writer.lock() = None;
    match fs::remove_file(&self.path) {
      Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
      _ => Ok(()),
    }
  }
}

/// A private, buffered cursor over one segment.
///
/// Tracks the byte offset and index of the next frame so that sequential
/// reads never seek.
pub(crate) struct SegmentReader {
  segment: Arc<Segment>,
  reader: BufReader<File>,
  /// Offset of the next frame.
  position: u64,
  /// Index expected at `position`.
  next_index: i64,
}

impl SegmentReader {
  /// Opens a reader positioned at the first record of the segment.
  pub fn open(segment: Arc<Segment>, buffer_size: usize) -> Result<Self> {
    let mut file = File::open(segment.path())?;
    let position = SegmentDescriptor::SIZE as u64;
    file.seek(SeekFrom::Start(position))?;

    Ok(Self {
      next_index: segment.base_index(),
      segment,
      reader: BufReader::with_capacity(buffer_size, file),
      position,
    })
  }

  pub fn segment(&self) -> &Arc<Segment> {
    &self.segment
  }

  pub fn next_index(&self) -> i64 {
    self.next_index
  }

  pub fn position(&self) -> u64 {
    self.position
  }

  /// Moves the cursor to the frame at `offset`, which holds record `index`.
  /// Always discards read-ahead data.
  pub fn seek_to(&mut self, offset: u64, index: i64) -> Result<()> {
    self.reader.seek(SeekFrom::Start(offset))?;
    self.position = offset;
    self.next_index = index;
    Ok(())
  }

  /// Returns true if the segment holds a record at the cursor.
  pub fn has_next(&self) -> bool {
    self.next_index <= self.segment.last_index()
  }

  /// Advances over records without reading their payload until the cursor
  /// reaches `index` or the end of the segment.
  pub fn skip_until(&mut self, index: i64) -> Result<()> {
    while self.next_index < index && self.has_next() {
      let header = self.read_header()?;
      self.reader.seek_relative(header.data_len as i64)?;
      self.position += header.frame_len as u64;
      self.next_index += 1;
    }
    Ok(())
  }

  /// Reads and validates the record at the cursor.
  /// Returns `None` when the cursor is past the segment's last record.
  pub fn next_record(&mut self) -> Result<Option<JournalRecord>> {
    if !self.has_next() {
      return Ok(None);
    }

    let header = self.read_header()?;
    let mut data = vec![0u8; header.data_len as usize];
    self.reader.read_exact(&mut data)?;

    let actual = compute_checksum(header.index, header.asqn, &data);
    if actual != header.checksum {
      return Err(self.corruption(format!(
        "checksum mismatch for record {}: expected {:#018x}, got {:#018x}",
        header.index, header.checksum, actual
      )));
    }

    self.position += header.frame_len as u64;
    self.next_index += 1;
    Ok(Some(header.into_record(data)))
  }

  fn read_header(&mut self) -> Result<FrameHeader> {
    let confirmed = self.segment.confirmed_len();
    if self.position + FrameHeader::SIZE as u64 > confirmed {
      return Err(self.corruption(format!("header beyond confirmed length {}", confirmed)));
    }

    let header = FrameHeader::read(&mut self.reader)?;
    if let Err(reason) = header.validate(self.next_index) {
      return Err(self.corruption(reason));
    }
    if self.position + header.frame_len as u64 > confirmed {
      return Err(self.corruption(format!("frame beyond confirmed length {}", confirmed)));
    }
    Ok(header)
  }

  fn corruption(&self, reason: String) -> Error {
    Error::Corruption(format!(
      "Segment {} at offset {}: {}",
      self.segment.id(),
      self.position,
      reason
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::ASQN_IGNORE;
  use tempfile::TempDir;

  fn setup(max_size: u64) -> (TempDir, Arc<Segment>, JournalOptions) {
    let dir = TempDir::new().unwrap();
    let options = JournalOptions::new(dir.path());
    let path = dir.path().join(util::segment_filename("journal", 1));
    let segment = Arc::new(Segment::create(path, SegmentDescriptor::new(1, 10, max_size, None)).unwrap());
    segment.activate(&options).unwrap();
    (dir, segment, options)
  }

  #[test]
  fn test_append_and_read() {
    let (_dir, segment, options) = setup(4096);
    assert_eq!(segment.last_index(), 9);

    for i in 0..5 {
      let record = JournalRecord::new(10 + i, ASQN_IGNORE, vec![i as u8; 10]);
      segment.append(&record).unwrap();
    }
    assert_eq!(segment.last_index(), 14);

    let mut reader = SegmentReader::open(segment.clone(), options.read_buffer_size).unwrap();
    for i in 0..5 {
      let record = reader.next_record().unwrap().unwrap();
      assert_eq!(record.index, 10 + i);
      assert_eq!(record.data, vec![i as u8; 10]);
    }
    assert!(reader.next_record().unwrap().is_none());
  }

  #[test]
  fn test_skip_and_seek() {
    let (_dir, segment, options) = setup(4096);
    let mut offsets = Vec::new();
    for i in 0..5 {
      offsets.push(segment.append(&JournalRecord::new(10 + i, i, vec![1u8; 3])).unwrap());
    }

    let mut reader = SegmentReader::open(segment.clone(), options.read_buffer_size).unwrap();
    reader.skip_until(13).unwrap();
    assert_eq!(reader.position(), offsets[3]);
    assert_eq!(reader.next_record().unwrap().unwrap().index, 13);

    reader.seek_to(offsets[1], 11).unwrap();
    assert_eq!(reader.next_record().unwrap().unwrap().asqn, 1);
  }

  #[test]
  fn test_room_accounting() {
    let (_dir, segment, _options) = setup(SegmentDescriptor::SIZE as u64 + 100);
    let record = JournalRecord::new(10, ASQN_IGNORE, vec![0u8; 40]); // 72 byte frame
    assert!(segment.has_room_for(record.frame_size()));
    segment.append(&record).unwrap();
    assert!(!segment.has_room_for(record.frame_size()));
  }

  #[test]
  fn test_truncate_hides_tail() {
    let (_dir, segment, options) = setup(4096);
    let mut offsets = Vec::new();
    for i in 0..3 {
      offsets.push(segment.append(&JournalRecord::new(10 + i, ASQN_IGNORE, b"abc".to_vec())).unwrap());
    }

    segment.truncate(offsets[1], 10).unwrap();
    assert_eq!(segment.last_index(), 10);
    assert_eq!(fs::metadata(segment.path()).unwrap().len(), offsets[1]);

    // Appending after truncation reuses the index and the offset.
    let offset = segment.append(&JournalRecord::new(11, ASQN_IGNORE, b"new".to_vec())).unwrap();
    assert_eq!(offset, offsets[1]);

    let mut reader = SegmentReader::open(segment.clone(), options.read_buffer_size).unwrap();
    reader.skip_until(11).unwrap();
    assert_eq!(reader.next_record().unwrap().unwrap().data, b"new".to_vec());
    assert!(reader.next_record().unwrap().is_none());
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn test_failed_append_reports_io_error() {
    let options = JournalOptions::default();
    let segment = Segment::open(PathBuf::from("/dev/full"), SegmentDescriptor::new(1, 1, 4096, None), 0, 0);
    segment.activate(&options).unwrap();

    // The confirmed length no longer matches the device, so the writer cannot be reopened.
    segment.confirmed_len.store(SegmentDescriptor::SIZE as u64, Ordering::Release);
    let record = JournalRecord::new(1, ASQN_IGNORE, b"abc".to_vec());
    assert!(matches!(segment.append(&record), Err(Error::Io(_))));
    assert_eq!(segment.last_index(), 0);

    // Reactivation surfaces the underlying I/O error as well
    assert!(matches!(segment.activate(&options), Err(Error::Io(_))));
  }
}
