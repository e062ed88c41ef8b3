mod loader;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::config::{JournalOptions, SyncMode};
use crate::descriptor::SegmentDescriptor;
use crate::error::{Error, Result};
use crate::index::SparseIndex;
use crate::metastore::Metastore;
use crate::reader::JournalReader;
use crate::record::{ASQN_IGNORE, JournalRecord};
use crate::segment::{Segment, SegmentReader};
use crate::util::segment_filename;

use loader::RecoveryOutcome;

/// Highest index the journal assigns. Keeps `last_index + 1` representable.
const MAX_INDEX: i64 = i64::MAX - 1;

/// Mutable journal state. Every mutation happens under the write lock.
struct Segments {
  /// Base index -> segment. The last entry is the active segment.
  map: BTreeMap<i64, Arc<Segment>>,
  index: SparseIndex,
  /// Last real asqn ever appended, minus records discarded by truncation.
  last_asqn: Option<i64>,
  /// Cached copy of the metastore watermark.
  last_flushed_index: Option<i64>,
  next_segment_id: u64,
}

impl Segments {
  fn active(&self) -> Result<&Arc<Segment>> {
    self
      .map
      .values()
      .next_back()
      .ok_or_else(|| Error::Corruption("Journal has no active segment".into()))
  }

  /// Returns the segment whose range contains `index` (floor by base index).
  fn segment_for(&self, index: i64) -> Option<&Arc<Segment>> {
    self.map.range(..=index).next_back().map(|(_, s)| s)
  }
}

/// A resolved read position: the segment holding a record and the closest
/// known frame at or before it.
pub(crate) struct Position {
  pub segment: Arc<Segment>,
  pub offset: u64,
  pub index: i64,
}

pub(crate) struct JournalState {
  options: JournalOptions,
  metastore: Arc<dyn Metastore>,
  segments: RwLock<Segments>,

  // Live bounds, readable without the lock.
  first_index: AtomicI64,
  last_index: AtomicI64,
  /// Bumped before and after every truncation, compaction and reset; odd
  /// while one is in progress.
  epoch: AtomicU64,
  open: AtomicBool,
}

/// Ends a mutation when dropped, even if it bailed out early.
struct MutationGuard<'a>(&'a AtomicU64);

impl Drop for MutationGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_add(1, Ordering::AcqRel);
  }
}

/// A segmented, append-only journal.
///
/// Cloning is cheap; all clones share the same journal. Mutations are
/// serialized internally, and any number of [`JournalReader`]s may read
/// concurrently with the writer.
#[derive(Clone)]
pub struct Journal {
  inner: Arc<JournalState>,
}

impl Journal {
  /// Opens (or creates) the journal in `options.directory`, running recovery.
  ///
  /// Fails with [`Error::CorruptedJournal`] if data at or below the
  /// metastore's last flushed index is damaged or missing.
  pub fn open(options: JournalOptions, metastore: Arc<dyn Metastore>) -> Result<Self> {
    options.validate()?;
    fs::create_dir_all(&options.directory)?;

    let last_flushed_index = metastore.load_last_flushed_index()?;
    let loaded = loader::load(&options, last_flushed_index)?;

    if let RecoveryOutcome::FatalCorruption { index, reason } = loaded.outcome {
      return Err(Error::CorruptedJournal { index, reason });
    }

    let mut segments = Segments {
      map: loaded.segments.into_iter().map(|s| (s.base_index(), s)).collect(),
      index: loaded.index,
      last_asqn: loaded.last_asqn,
      last_flushed_index,
      next_segment_id: loaded.next_segment_id,
    };

    if segments.map.is_empty() {
      info!(target: "segjournal", "No segments found in {}, starting a new journal", options.directory.display());
      if last_flushed_index.is_some() {
        metastore.reset_last_flushed_index()?;
        segments.last_flushed_index = None;
      }
      Self::create_segment(&options, &mut segments, 1)?;
    }

    let active = segments.active()?.clone();
    active.activate(&options)?;

    let first_index = segments.map.values().next().map(|s| s.base_index()).unwrap_or(1);
    let last_index = active.last_index();

    Ok(Self {
      inner: Arc::new(JournalState {
        options,
        metastore,
        segments: RwLock::new(segments),
        first_index: AtomicI64::new(first_index),
        last_index: AtomicI64::new(last_index),
        epoch: AtomicU64::new(0),
        open: AtomicBool::new(true),
      }),
    })
  }

  fn create_segment(options: &JournalOptions, segments: &mut Segments, base_index: i64) -> Result<Arc<Segment>> {
    let id = segments.next_segment_id;
    let path = options.directory.join(segment_filename(&options.name, id));
    let descriptor = SegmentDescriptor::new(id, base_index, options.max_segment_size, segments.last_asqn);

    let segment = Arc::new(Segment::create(path, descriptor)?);
    segment.activate(options)?;

    segments.next_segment_id += 1;
    segments.map.insert(base_index, segment.clone());
    debug!(target: "segjournal", "Created segment {} starting at index {}", id, base_index);
    Ok(segment)
  }

  fn ensure_open(&self) -> Result<()> {
    if self.is_open() { Ok(()) } else { Err(Error::Closed) }
  }

  // --- Bounds ---

  /// Index of the oldest live record (or of the next append, if empty).
  pub fn first_index(&self) -> i64 {
    self.inner.first_index.load(Ordering::Acquire)
  }

  /// Index of the newest live record (`first_index() - 1` if empty).
  pub fn last_index(&self) -> i64 {
    self.inner.last_index.load(Ordering::Acquire)
  }

  pub fn is_empty(&self) -> bool {
    self.last_index() < self.first_index()
  }

  /// Last real asqn appended. Compaction never lowers it; truncation and
  /// reset forget the asqns of the records they discard.
  pub fn last_asqn(&self) -> Option<i64> {
    self.inner.segments.read().last_asqn
  }

  /// Number of segment files currently backing the journal.
  pub fn segment_count(&self) -> usize {
    self.inner.segments.read().map.len()
  }

  /// ID of the oldest segment.
  pub fn first_segment_id(&self) -> Option<u64> {
    self.inner.segments.read().map.values().next().map(|s| s.id())
  }

  pub fn is_open(&self) -> bool {
    self.inner.open.load(Ordering::Acquire)
  }

  pub(crate) fn epoch(&self) -> u64 {
    self.inner.epoch.load(Ordering::Acquire)
  }

  /// Returns the mutation epoch, waiting out a mutation in progress.
  pub(crate) fn stable_epoch(&self) -> u64 {
    let epoch = self.epoch();
    if epoch % 2 == 0 {
      return epoch;
    }
    // Mutations hold the write lock until they are complete.
    drop(self.inner.segments.read());
    self.epoch()
  }

  /// Marks a truncation, compaction or reset as in progress for readers.
  fn begin_mutation(&self) -> MutationGuard<'_> {
    self.inner.epoch.fetch_add(1, Ordering::AcqRel);
    MutationGuard(&self.inner.epoch)
  }

  pub(crate) fn options(&self) -> &JournalOptions {
    &self.inner.options
  }

  // --- Write Operations ---

  /// Index assigned to the next append.
  fn next_index(&self) -> Result<i64> {
    let last = self.last_index();
    if last >= MAX_INDEX {
      return Err(Error::IndexOverflow { last });
    }
    Ok(last + 1)
  }

  /// Appends `data` with the given asqn. The journal assigns the index.
  ///
  /// Fails with [`Error::InvalidAsqn`] if `asqn` is not [`ASQN_IGNORE`] and
  /// not greater than the last real asqn.
  pub fn append(&self, asqn: i64, data: &[u8]) -> Result<JournalRecord> {
    let mut segments = self.inner.segments.write();
    self.ensure_open()?;
    let record = JournalRecord::new(self.next_index()?, asqn, data);
    self.append_locked(&mut segments, record)
  }

  /// Appends `data` without an asqn.
  pub fn append_data(&self, data: &[u8]) -> Result<JournalRecord> {
    self.append(ASQN_IGNORE, data)
  }

  /// Adopts a record produced elsewhere (e.g. replicated from a leader).
  ///
  /// The record must carry exactly the next index and a checksum matching
  /// its content.
  pub fn append_record(&self, record: &JournalRecord) -> Result<JournalRecord> {
    let mut segments = self.inner.segments.write();
    self.ensure_open()?;

    let expected = self.next_index()?;
    if record.index != expected {
      return Err(Error::InvalidIndex {
        expected,
        actual: record.index,
      });
    }
    record.verify_checksum()?;

    self.append_locked(&mut segments, record.clone())
  }

  fn append_locked(&self, segments: &mut Segments, record: JournalRecord) -> Result<JournalRecord> {
    let options = &self.inner.options;

    if record.has_asqn() {
      if let Some(last) = segments.last_asqn {
        if record.asqn <= last {
          return Err(Error::InvalidAsqn {
            last,
            actual: record.asqn,
          });
        }
      }
    }

    let frame_size = record.frame_size();
    let max_frame_size = options.max_segment_size - SegmentDescriptor::SIZE as u64;
    if frame_size > max_frame_size {
      return Err(Error::RecordTooLarge {
        size: frame_size,
        max: max_frame_size,
      });
    }

    // --- Check for Rollover ---
    let mut segment = segments.active()?.clone();
    if !segment.has_room_for(frame_size) {
      segment.seal()?;
      segment = Self::create_segment(options, segments, record.index)?;
    }
    // Reopens the writer if a failed append lost it.
    segment.activate(options)?;

    // --- Write the record ---
    let offset = segment.append(&record)?;
    segments.index.record(&record, segment.id(), segment.base_index(), offset);
    if record.has_asqn() {
      segments.last_asqn = Some(record.asqn);
    }
    self.inner.last_index.store(record.index, Ordering::Release);

    if options.sync_mode == SyncMode::Strict {
      self.flush_locked(segments)?;
    }

    Ok(record)
  }

  /// Forces appended records to stable storage and advances the metastore's
  /// last flushed index.
  pub fn flush(&self) -> Result<()> {
    let mut segments = self.inner.segments.write();
    self.ensure_open()?;
    self.flush_locked(&mut segments)
  }

  fn flush_locked(&self, segments: &mut Segments) -> Result<()> {
    // Sealed segments were synced on rollover.
    segments.active()?.flush()?;

    let last = self.last_index();
    if self.is_empty() || segments.last_flushed_index == Some(last) {
      return Ok(());
    }
    self.inner.metastore.store_last_flushed_index(last)?;
    segments.last_flushed_index = Some(last);
    Ok(())
  }

  // --- Maintenance ---

  /// Discards every record with an index greater than `index`.
  ///
  /// Idempotent if `index >= last_index()`. Truncating below the first
  /// index empties the journal and primes the next append to `index + 1`.
  pub fn delete_after(&self, index: i64) -> Result<()> {
    let mut segments = self.inner.segments.write();
    self.ensure_open()?;

    if index >= self.last_index() {
      return Ok(());
    }
    if index < self.first_index() {
      return self.reset_locked(&mut segments, index.max(0) + 1);
    }

    // 1. Lower the watermark before any record goes away
    if segments.last_flushed_index.is_some_and(|flushed| flushed > index) {
      self.inner.metastore.store_last_flushed_index(index)?;
      segments.last_flushed_index = Some(index);
    }
    let _mutation = self.begin_mutation();

    // 2. Drop whole segments that start after the truncation point, newest first
    let removed = segments.map.split_off(&(index + 1));
    for segment in removed.values().rev() {
      self.delete_segment_file(segment);
    }
    segments.index.delete_after(index);

    // 3. Cut the segment holding `index` right after it
    let segment = segments
      .segment_for(index)
      .cloned()
      .ok_or_else(|| Error::Corruption(format!("No segment holds index {}", index)))?;

    if segment.last_index() > index {
      let position = self.position_in(&segments, &segment, index + 1);
      let mut reader = SegmentReader::open(segment.clone(), self.inner.options.read_buffer_size)?;
      reader.seek_to(position.offset, position.index)?;
      reader.skip_until(index + 1)?;
      segment.truncate(reader.position(), index)?;
    }
    segment.activate(&self.inner.options)?;

    // 4. Update derived state
    segments.last_asqn = self.find_last_asqn(&segments, index)?;
    self.inner.last_index.store(index, Ordering::Release);

    debug!(target: "segjournal", "Truncated journal after index {} ({} segment(s) removed)", index, removed.len());
    Ok(())
  }

  /// Removes every segment whose records all have an index lower than
  /// `index`. Segments are never split, so the new first index may still be
  /// lower than `index`. The active segment is never removed.
  ///
  /// Returns true if at least one segment was removed.
  pub fn delete_until(&self, index: i64) -> Result<bool> {
    let mut segments = self.inner.segments.write();
    self.ensure_open()?;

    let keep_from = match segments.segment_for(index) {
      Some(segment) => segment.base_index(),
      None => return Ok(false),
    };

    let kept = segments.map.split_off(&keep_from);
    let removed = std::mem::replace(&mut segments.map, kept);
    if removed.is_empty() {
      return Ok(false);
    }
    let _mutation = self.begin_mutation();

    for segment in removed.values() {
      self.delete_segment_file(segment);
    }

    segments.index.delete_until(keep_from);
    self.inner.first_index.store(keep_from, Ordering::Release);

    debug!(target: "segjournal", "Compacted journal up to index {} ({} segment(s) removed)", keep_from, removed.len());
    Ok(true)
  }

  /// Discards every record and primes the next append to be assigned `index`.
  pub fn reset(&self, index: i64) -> Result<()> {
    if index < 1 {
      return Err(Error::InvalidIndex { expected: 1, actual: index });
    }
    if index > MAX_INDEX {
      return Err(Error::InvalidIndex {
        expected: MAX_INDEX,
        actual: index,
      });
    }
    let mut segments = self.inner.segments.write();
    self.ensure_open()?;
    self.reset_locked(&mut segments, index)
  }

  fn reset_locked(&self, segments: &mut Segments, index: i64) -> Result<()> {
    if segments.last_flushed_index.is_some() {
      self.inner.metastore.reset_last_flushed_index()?;
      segments.last_flushed_index = None;
    }
    let _mutation = self.begin_mutation();

    // Newest first: an interrupted reset leaves a prefix of the journal.
    let removed = std::mem::take(&mut segments.map);
    for segment in removed.values().rev() {
      self.delete_segment_file(segment);
    }

    segments.index.clear();
    segments.last_asqn = None;

    Self::create_segment(&self.inner.options, segments, index)?;

    self.inner.first_index.store(index, Ordering::Release);
    self.inner.last_index.store(index - 1, Ordering::Release);

    info!(target: "segjournal", "Reset journal, next index is {}", index);
    Ok(())
  }

  fn delete_segment_file(&self, segment: &Segment) {
    match segment.delete() {
      Ok(()) => debug!(target: "segjournal", "Deleted segment {}", segment.id()),
      Err(e) => {
        error!(target: "segjournal", "Failed to delete segment file {}: {}", segment.path().display(), e);
      }
    }
  }

  /// Last real asqn among records `<= index`, using the sparse samples to
  /// bound the scan. Falls back to the asqn carried over by the first segment.
  fn find_last_asqn(&self, segments: &Segments, index: i64) -> Result<Option<i64>> {
    let mut next = segments.index.lookup_asqn(i64::MAX, index).unwrap_or(self.first_index());
    let mut last_asqn = None;

    while next <= index {
      let Some(segment) = segments.segment_for(next).cloned() else {
        break;
      };
      let position = self.position_in(segments, &segment, next);
      let mut reader = SegmentReader::open(segment, self.inner.options.read_buffer_size)?;
      reader.seek_to(position.offset, position.index)?;
      reader.skip_until(next)?;

      let scan_start = next;
      while next <= index {
        match reader.next_record()? {
          Some(record) => {
            if record.has_asqn() {
              last_asqn = Some(record.asqn);
            }
            next += 1;
          }
          None => break,
        }
      }
      if next == scan_start {
        break;
      }
    }
    let carried = segments.map.values().next().and_then(|s| s.prior_asqn());
    Ok(last_asqn.or(carried))
  }

  // --- Read Support ---

  /// Opens a new reader positioned at the first record.
  pub fn open_reader(&self) -> Result<JournalReader> {
    self.ensure_open()?;
    Ok(JournalReader::new(self.clone()))
  }

  fn position_in(&self, segments: &Segments, segment: &Arc<Segment>, index: i64) -> Position {
    match segments.index.lookup(index) {
      Some(info) if info.segment_id == segment.id() => Position {
        segment: segment.clone(),
        offset: info.offset,
        index: info.index,
      },
      _ => Position {
        segment: segment.clone(),
        offset: SegmentDescriptor::SIZE as u64,
        index: segment.base_index(),
      },
    }
  }

  /// Resolves the closest known frame at or before `index`.
  /// The lock is held only to clone the segment handle.
  pub(crate) fn locate(&self, index: i64) -> Option<Position> {
    let segments = self.inner.segments.read();
    let segment = segments.segment_for(index)?.clone();
    Some(self.position_in(&segments, &segment, index))
  }

  /// Index of a sampled record whose asqn is `<= asqn`, to start an asqn scan from.
  pub(crate) fn asqn_hint(&self, asqn: i64, index_upper_bound: i64) -> Option<i64> {
    self.inner.segments.read().index.lookup_asqn(asqn, index_upper_bound)
  }

  // --- Lifecycle ---

  /// Flushes the journal and releases every file handle.
  /// Closing an already closed journal is a no-op.
  pub fn close(&self) -> Result<()> {
    let mut segments = self.inner.segments.write();
    if !self.is_open() {
      return Ok(());
    }

    self.flush_locked(&mut segments)?;
    for segment in segments.map.values() {
      segment.seal()?;
    }
    self.inner.open.store(false, Ordering::Release);

    info!(target: "segjournal", "Closed journal {} at index {}", self.inner.options.name, self.last_index());
    Ok(())
  }
}

impl std::fmt::Debug for Journal {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Journal")
      .field("directory", &self.inner.options.directory)
      .field("first_index", &self.first_index())
      .field("last_index", &self.last_index())
      .field("open", &self.is_open())
      .finish()
  }
}
