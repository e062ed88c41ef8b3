use crate::record::JournalRecord;
use std::collections::BTreeMap;

/// Physical location of a sampled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexInfo {
  pub index: i64,
  pub segment_id: u64,
  /// Byte offset of the record's frame within the segment file.
  pub offset: u64,
}

/// In-memory, sampled mapping from record index to location.
///
/// Every `density`-th record of a segment is kept (the first record of a
/// segment always is), so a floor lookup followed by a linear scan visits at
/// most `density` records. Sampled records with a real asqn are also kept in
/// an asqn -> index map used to skip ahead when seeking by asqn.
///
/// This is derived state only: it is rebuilt from the segments on open.
#[derive(Debug)]
pub(crate) struct SparseIndex {
  density: u64,
  positions: BTreeMap<i64, IndexInfo>,
  asqns: BTreeMap<i64, i64>,
}

impl SparseIndex {
  pub fn new(density: u64) -> Self {
    Self {
      density: density.max(1),
      positions: BTreeMap::new(),
      asqns: BTreeMap::new(),
    }
  }

  /// Offers an appended record to the index. Only sampled records are stored.
  pub fn record(&mut self, record: &JournalRecord, segment_id: u64, segment_base: i64, offset: u64) {
    if (record.index - segment_base) as u64 % self.density != 0 {
      return;
    }

    self.positions.insert(
      record.index,
      IndexInfo {
        index: record.index,
        segment_id,
        offset,
      },
    );
    if record.has_asqn() {
      self.asqns.insert(record.asqn, record.index);
    }
  }

  /// Returns the sampled entry with the largest index `<= index`.
  pub fn lookup(&self, index: i64) -> Option<IndexInfo> {
    self.positions.range(..=index).next_back().map(|(_, info)| *info)
  }

  /// Returns the index of the sampled record with the largest asqn `<= asqn`
  /// whose index does not exceed `index_upper_bound`.
  pub fn lookup_asqn(&self, asqn: i64, index_upper_bound: i64) -> Option<i64> {
    self
      .asqns
      .range(..=asqn)
      .rev()
      .map(|(_, index)| *index)
      .find(|index| *index <= index_upper_bound)
  }

  /// Drops every entry with an index greater than `index`.
  pub fn delete_after(&mut self, index: i64) {
    if index == i64::MAX {
      return;
    }
    self.positions.split_off(&(index + 1));
    self.asqns.retain(|_, i| *i <= index);
  }

  /// Drops every entry with an index lower than `index`.
  pub fn delete_until(&mut self, index: i64) {
    self.positions = self.positions.split_off(&index);
    self.asqns.retain(|_, i| *i >= index);
  }

  pub fn clear(&mut self) {
    self.positions.clear();
    self.asqns.clear();
  }

  pub fn len(&self) -> usize {
    self.positions.len()
  }
}
