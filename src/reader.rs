use std::sync::Arc;

use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::record::JournalRecord;
use crate::segment::SegmentReader;

/// An independent cursor over a [`Journal`].
///
/// Readers hold no lock. Every call re-derives the live bounds from the
/// journal, so a reader positioned past a truncation point simply reports no
/// more data, and a reader positioned on an index that was truncated and
/// re-appended observes the new record there.
pub struct JournalReader {
  journal: Journal,
  /// Index of the record the next call to `next` returns.
  next_index: i64,
  /// Journal mutation epoch the cursor was positioned under.
  epoch: u64,
  cursor: Option<SegmentReader>,
}

impl JournalReader {
  pub(crate) fn new(journal: Journal) -> Self {
    Self {
      epoch: journal.stable_epoch(),
      next_index: journal.first_index(),
      journal,
      cursor: None,
    }
  }

  /// Index of the record the next call to `next` returns.
  pub fn next_index(&self) -> i64 {
    self.next_index
  }

  /// Returns true if a record exists at the cursor.
  pub fn has_next(&mut self) -> bool {
    if !self.journal.is_open() {
      return false;
    }
    self.sync_epoch();
    self.next_index <= self.journal.last_index()
  }

  // --- Seeking ---

  /// Positions the reader so the next record returned has `index`, clamped
  /// into `[first_index, last_index + 1]`. Returns the resulting next index.
  pub fn seek(&mut self, index: i64) -> Result<i64> {
    self.ensure_open()?;

    // Load the epoch first so a concurrent mutation is noticed on the next read.
    self.epoch = self.journal.stable_epoch();
    let first = self.journal.first_index();
    let last = self.journal.last_index();
    self.next_index = index.min(last + 1).max(first);

    if self.next_index <= last {
      if let Err(e) = self.position_cursor() {
        if !self.epoch_changed() {
          return Err(e);
        }
        // Raced a mutation; the next read repositions.
        self.cursor = None;
      }
    }
    Ok(self.next_index)
  }

  pub fn seek_to_first(&mut self) -> Result<i64> {
    self.seek(i64::MIN)
  }

  /// Positions the reader on the last record (or at the end, if empty).
  pub fn seek_to_last(&mut self) -> Result<i64> {
    self.ensure_open()?;
    let last = self.journal.last_index();
    self.seek(last)
  }

  /// Positions the reader on the record with the largest asqn `<= asqn`.
  /// Falls back to the first record if no record qualifies.
  pub fn seek_to_asqn(&mut self, asqn: i64) -> Result<i64> {
    self.seek_to_asqn_bounded(asqn, i64::MAX)
  }

  /// Like [`seek_to_asqn`](Self::seek_to_asqn), only considering records
  /// with an index `<= index_upper_bound`.
  ///
  /// Records without an asqn are never the match, but they are still
  /// returned when reading on from the found position.
  pub fn seek_to_asqn_bounded(&mut self, asqn: i64, index_upper_bound: i64) -> Result<i64> {
    self.ensure_open()?;

    let bound = index_upper_bound.min(self.journal.last_index());
    let start = self.journal.asqn_hint(asqn, bound).unwrap_or(i64::MIN);
    self.seek(start)?;

    // Real asqns grow with the index, so the scan stops at the first one above the target.
    let mut found = None;
    while self.next_index <= bound {
      let Some(record) = self.read_next()? else {
        break;
      };
      if record.has_asqn() {
        if record.asqn > asqn {
          break;
        }
        found = Some(record.index);
      }
    }

    match found {
      Some(index) => self.seek(index),
      None => self.seek_to_first(),
    }
  }

  /// Releases the reader's file handle.
  pub fn close(self) {}

  // --- Internals ---

  fn ensure_open(&self) -> Result<()> {
    if self.journal.is_open() { Ok(()) } else { Err(Error::Closed) }
  }

  fn epoch_changed(&self) -> bool {
    self.journal.epoch() != self.epoch
  }

  /// Pulls the cursor back into the live range after a truncation,
  /// compaction or reset. The physical position is always rebuilt since the
  /// bytes under it may have been replaced.
  fn sync_epoch(&mut self) {
    let epoch = self.journal.stable_epoch();
    if epoch == self.epoch {
      return;
    }
    self.epoch = epoch;
    self.cursor = None;

    let first = self.journal.first_index();
    let last = self.journal.last_index();
    self.next_index = self.next_index.min(last + 1).max(first);
  }

  /// Makes sure the cursor sits on the frame of `next_index`.
  fn position_cursor(&mut self) -> Result<()> {
    if let Some(cursor) = &self.cursor {
      if cursor.next_index() == self.next_index && cursor.has_next() {
        return Ok(());
      }
    }

    let position = self
      .journal
      .locate(self.next_index)
      .ok_or_else(|| Error::Corruption(format!("No segment holds index {}", self.next_index)))?;

    let mut cursor = match self.cursor.take() {
      Some(mut cursor) if Arc::ptr_eq(cursor.segment(), &position.segment) => {
        // Scanning on from the current position beats a seek unless the
        // sparse entry is closer.
        let ahead = cursor.next_index() <= self.next_index && cursor.next_index() >= position.index;
        if !ahead {
          cursor.seek_to(position.offset, position.index)?;
        }
        cursor
      }
      _ => {
        let mut cursor = SegmentReader::open(position.segment, self.journal.options().read_buffer_size)?;
        cursor.seek_to(position.offset, position.index)?;
        cursor
      }
    };

    cursor.skip_until(self.next_index)?;
    if cursor.next_index() != self.next_index {
      return Err(Error::Corruption(format!(
        "Segment {} ends at index {} before index {}",
        cursor.segment().id(),
        cursor.segment().last_index(),
        self.next_index
      )));
    }
    self.cursor = Some(cursor);
    Ok(())
  }

  /// Reads the record at the cursor and advances, retrying when a concurrent
  /// mutation invalidated the position.
  fn read_next(&mut self) -> Result<Option<JournalRecord>> {
    self.ensure_open()?;

    loop {
      self.sync_epoch();
      if self.next_index > self.journal.last_index() {
        return Ok(None);
      }

      let result = self.position_cursor().and_then(|_| match self.cursor.as_mut() {
        Some(cursor) => cursor.next_record(),
        None => Ok(None),
      });

      // A record read under a stale epoch may come from replaced bytes.
      if self.epoch_changed() {
        continue;
      }

      match result {
        Ok(Some(record)) => {
          self.next_index = record.index + 1;
          return Ok(Some(record));
        }
        Ok(None) => return Ok(None),
        Err(e) => {
          self.cursor = None;
          return Err(e);
        }
      }
    }
  }
}

impl Iterator for JournalReader {
  type Item = Result<JournalRecord>;

  fn next(&mut self) -> Option<Self::Item> {
    self.read_next().transpose()
  }
}

impl std::fmt::Debug for JournalReader {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JournalReader")
      .field("next_index", &self.next_index)
      .field("epoch", &self.epoch)
      .finish()
  }
}
