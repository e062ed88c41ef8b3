use crate::error::Result;
use std::fs::File;
use std::path::Path;

/// Generates a segment filename from the journal name and a segment ID.
/// Format: journal-12.log
pub fn segment_filename(name: &str, id: u64) -> String {
  format!("{}-{}.log", name, id)
}

/// Parses a segment ID from a filename belonging to journal `name`.
pub fn parse_segment_id(name: &str, filename: &str) -> Option<u64> {
  let id = filename.strip_prefix(name)?.strip_prefix('-')?.strip_suffix(".log")?;
  if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  id.parse::<u64>().ok()
}

/// fsyncs a directory so that file creations, renames and removals inside it are persisted.
pub fn sync_dir(dir: &Path) -> Result<()> {
  File::open(dir)?.sync_all()?;
  Ok(())
}
