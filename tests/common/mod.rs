#![allow(dead_code)]

use segjournal::{Journal, JournalOptions, MemoryMetastore};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Size of a segment descriptor on disk.
pub const DESCRIPTOR_SIZE: u64 = 64;
/// Size of a record frame header on disk.
pub const HEADER_SIZE: u64 = 32;

pub struct TestEnv {
  pub journal: Journal,
  pub metastore: Arc<MemoryMetastore>,
  pub options: JournalOptions,
  // The TempDir guard must be kept alive to prevent premature deletion of the directory.
  pub _dir: TempDir,
}

impl TestEnv {
  pub fn new(mut options: JournalOptions) -> Self {
    let dir = tempfile::tempdir().unwrap();
    options.directory = dir.path().to_path_buf();

    let metastore = Arc::new(MemoryMetastore::new());
    let journal = Journal::open(options.clone(), metastore.clone()).unwrap();

    Self {
      journal,
      metastore,
      options,
      _dir: dir,
    }
  }

  pub fn with_default() -> Self {
    Self::new(JournalOptions::default())
  }

  /// Options whose segments hold exactly `records` records of `payload` bytes.
  pub fn options_for(records: u64, payload: u64) -> JournalOptions {
    let mut options = JournalOptions::default();
    options.max_segment_size = DESCRIPTOR_SIZE + records * (HEADER_SIZE + payload);
    options
  }

  /// Drops the journal without closing it (a crash) and opens it again.
  pub fn restart(self) -> Self {
    let TestEnv {
      journal,
      metastore,
      options,
      _dir,
    } = self;
    drop(journal);

    let journal = Journal::open(options.clone(), metastore.clone()).expect("Failed to reopen journal");
    Self {
      journal,
      metastore,
      options,
      _dir,
    }
  }

  /// Opens a second journal instance over the same directory and metastore.
  pub fn reopen(&self) -> segjournal::Result<Journal> {
    Journal::open(self.options.clone(), self.metastore.clone())
  }

  pub fn segment_path(&self, id: u64) -> PathBuf {
    self.options.directory.join(format!("{}-{}.log", self.options.name, id))
  }

  /// Appends `count` records with payload `payload_len` bytes and asqn equal
  /// to the index.
  pub fn fill(&self, count: usize, payload_len: usize) {
    for _ in 0..count {
      let index = self.journal.last_index() + 1;
      self.journal.append(index, &vec![index as u8; payload_len]).unwrap();
    }
  }
}
