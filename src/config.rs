use std::path::PathBuf;

use crate::descriptor::SegmentDescriptor;
use crate::error::{Error, Result};
use crate::record::FrameHeader;

/// Defines when appended records are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  /// Records reach the OS on every append but are only `fsync`ed when
  /// `Journal::flush` is called. The window of possibly-lost data is
  /// "appended since last flush".
  Explicit,

  /// Every append is followed by a full `flush`, including the metastore
  /// update. Safest, but highest latency.
  Strict,
}

#[derive(Debug, Clone)]
pub struct JournalOptions {
  /// Directory holding the segment files.
  pub directory: PathBuf,

  /// Prefix of every segment file name (`<name>-<id>.log`).
  pub name: String,

  // --- Segments ---
  /// Hard limit for a segment file size in bytes, descriptor included.
  /// The journal rolls over to a new segment before a record would cross it.
  /// Default: 128 MB.
  pub max_segment_size: u64,

  /// Every `index_density`-th record of a segment is sampled into the
  /// sparse index. Smaller values mean shorter scans and more memory.
  /// Default: 100.
  pub index_density: u64,

  // --- Resources ---
  /// Size of the in-memory write buffer of the active segment.
  /// Default: 64 KB.
  pub write_buffer_size: usize,

  /// Size of the buffer used by readers when scanning a segment.
  /// Default: 128 KB.
  pub read_buffer_size: usize,

  // --- Behavior ---
  pub sync_mode: SyncMode,
}

impl Default for JournalOptions {
  fn default() -> Self {
    Self {
      directory: PathBuf::from("./journal_data"),
      name: "journal".to_string(),
      max_segment_size: 128 * 1024 * 1024, // 128 MB
      index_density: 100,
      write_buffer_size: 64 * 1024, // 64 KB
      read_buffer_size: 128 * 1024, // 128 KB
      sync_mode: SyncMode::Explicit,
    }
  }
}

impl JournalOptions {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      ..Default::default()
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.name.trim().is_empty() {
      return Err(Error::Config("Journal name cannot be empty".into()));
    }
    if self.name.contains(['/', '\\', '\0']) {
      return Err(Error::Config(format!("Invalid journal name: {}", self.name)));
    }
    if self.index_density == 0 {
      return Err(Error::Config("Index density must be greater than zero".into()));
    }

    let min_size = (SegmentDescriptor::SIZE + FrameHeader::SIZE) as u64;
    if self.max_segment_size < min_size {
      return Err(Error::Config(format!(
        "Max segment size {} is smaller than the minimum of {} bytes",
        self.max_segment_size, min_size
      )));
    }
    if self.max_segment_size > u32::MAX as u64 {
      return Err(Error::Config(format!(
        "Max segment size {} exceeds the addressable maximum of {} bytes",
        self.max_segment_size,
        u32::MAX
      )));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_is_valid() {
    assert!(JournalOptions::default().validate().is_ok());
  }

  #[test]
  fn test_rejects_bad_values() {
    let mut opts = JournalOptions::default();
    opts.index_density = 0;
    assert!(matches!(opts.validate(), Err(Error::Config(_))));

    let mut opts = JournalOptions::default();
    opts.max_segment_size = 10;
    assert!(matches!(opts.validate(), Err(Error::Config(_))));

    let mut opts = JournalOptions::default();
    opts.name = "a/b".into();
    assert!(matches!(opts.validate(), Err(Error::Config(_))));
  }
}
