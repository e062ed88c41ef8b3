use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::config::JournalOptions;
use crate::descriptor::SegmentDescriptor;
use crate::error::{Error, Result};
use crate::index::SparseIndex;
use crate::record::{self, Decoded};
use crate::segment::Segment;
use crate::util;

/// What recovery concluded about the on-disk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RecoveryOutcome {
  /// Every segment was intact.
  Clean,
  /// An incomplete write was found after the durability watermark; the
  /// journal was truncated so that `index` is the next index to append.
  TruncatedAtUnflushedTail(i64),
  /// Data at or below the durability watermark is damaged or missing.
  FatalCorruption { index: i64, reason: String },
}

/// State rebuilt from the journal directory.
pub(crate) struct Loaded {
  pub segments: Vec<Arc<Segment>>,
  pub index: SparseIndex,
  /// Last real asqn, including the one carried over by the first segment.
  pub last_asqn: Option<i64>,
  pub next_segment_id: u64,
  pub outcome: RecoveryOutcome,
}

/// A segment whose descriptor and records were validated.
struct ScannedSegment {
  path: PathBuf,
  descriptor: SegmentDescriptor,
  valid_len: u64,
  last_index: i64,
}

/// First point at which the directory stops being a valid journal.
struct CorruptionPoint {
  /// Index of the first record that could not be recovered.
  index: i64,
  /// Position (in directory order) of the segment holding the damage.
  segment: usize,
  /// `false` if the whole segment is unusable (bad descriptor, gap).
  keep_segment: bool,
  reason: String,
}

/// Lists segment files belonging to the journal, ordered by segment ID.
fn list_segment_files(options: &JournalOptions) -> Result<Vec<(u64, PathBuf)>> {
  let mut files = Vec::new();
  for entry in fs::read_dir(&options.directory)? {
    let entry = entry?;
    if !entry.file_type()?.is_file() {
      continue;
    }
    let filename = entry.file_name().to_string_lossy().to_string();
    if let Some(id) = util::parse_segment_id(&options.name, &filename) {
      files.push((id, entry.path()));
    }
  }
  files.sort_unstable_by_key(|(id, _)| *id);
  Ok(files)
}

fn read_descriptor(path: &Path) -> Result<SegmentDescriptor> {
  let mut file = File::open(path)?;
  let mut buf = Vec::with_capacity(SegmentDescriptor::SIZE);
  file.by_ref().take(SegmentDescriptor::SIZE as u64).read_to_end(&mut buf)?;
  SegmentDescriptor::decode(&buf)
}

/// Validates every record of a segment, feeding the sparse index and the asqn
/// tracker. Returns the scan result and, if the segment ends in a damaged
/// frame, the reason.
fn scan_records(
  path: &Path,
  descriptor: SegmentDescriptor,
  index: &mut SparseIndex,
  last_asqn: &mut Option<i64>,
) -> Result<(ScannedSegment, Option<String>)> {
  let file = File::open(path)?;
  let file_len = file.metadata()?.len();

  let mut offset = SegmentDescriptor::SIZE as u64;
  let mut next_index = descriptor.index;
  let mut damage = None;

  if file_len > offset {
    // Safety: the journal is not open yet, so nothing else in this process
    // writes the file while the map is alive.
    let mmap = unsafe { Mmap::map(&file)? };

    loop {
      match record::decode(&mmap[offset as usize..], next_index) {
        Decoded::Record(record, len) => {
          index.record(&record, descriptor.id, descriptor.index, offset);
          if record.has_asqn() {
            *last_asqn = Some(record.asqn);
          }
          offset += len;
          next_index += 1;
        }
        Decoded::End => break,
        Decoded::Invalid(reason) => {
          damage = Some(format!("segment {} offset {}: {}", descriptor.id, offset, reason));
          break;
        }
      }
    }
  }

  let scanned = ScannedSegment {
    path: path.to_path_buf(),
    descriptor,
    valid_len: offset,
    last_index: next_index - 1,
  };
  Ok((scanned, damage))
}

/// Scans the journal directory and rebuilds the segment list and sparse index.
///
/// Damage above `last_flushed_index` is repaired by truncation; damage at or
/// below it is reported as `FatalCorruption` and nothing is modified.
pub(crate) fn load(options: &JournalOptions, last_flushed_index: Option<i64>) -> Result<Loaded> {
  let files = list_segment_files(options)?;
  let next_segment_id = files.last().map(|(id, _)| id + 1).unwrap_or(1);

  let mut index = SparseIndex::new(options.index_density);
  let mut last_asqn = None;
  let mut scanned: Vec<ScannedSegment> = Vec::with_capacity(files.len());
  let mut corruption: Option<CorruptionPoint> = None;

  // --- Phase 1: Scan (read-only) ---
  for (position, (id, path)) in files.iter().enumerate() {
    let expected_index = scanned.last().map(|s| s.last_index + 1);

    let descriptor = match read_descriptor(path) {
      Ok(d) if d.id == *id => d,
      Ok(d) => {
        corruption = Some(CorruptionPoint {
          index: expected_index.unwrap_or(1),
          segment: position,
          keep_segment: false,
          reason: format!("file {} holds descriptor of segment {}", path.display(), d.id),
        });
        break;
      }
      Err(Error::Io(e)) => return Err(Error::Io(e)),
      Err(e) => {
        corruption = Some(CorruptionPoint {
          index: expected_index.unwrap_or(1),
          segment: position,
          keep_segment: false,
          reason: format!("unreadable descriptor in {}: {}", path.display(), e),
        });
        break;
      }
    };

    if let Some(expected) = expected_index {
      if descriptor.index != expected {
        corruption = Some(CorruptionPoint {
          index: expected,
          segment: position,
          keep_segment: false,
          reason: format!(
            "segment {} starts at index {}, expected {}",
            descriptor.id, descriptor.index, expected
          ),
        });
        break;
      }
    }

    if scanned.is_empty() {
      last_asqn = descriptor.prior_asqn;
    }
    let (segment, damage) = scan_records(path, descriptor, &mut index, &mut last_asqn)?;
    debug!(target: "segjournal", "Scanned segment {} (indices {}..={})", segment.descriptor.id, segment.descriptor.index, segment.last_index);

    let next = segment.last_index + 1;
    scanned.push(segment);

    if let Some(reason) = damage {
      corruption = Some(CorruptionPoint {
        index: next,
        segment: position,
        keep_segment: true,
        reason,
      });
      break;
    }
  }

  // --- Phase 2: Assess ---
  let last_index = scanned.last().map(|s| s.last_index);
  let outcome = match (&corruption, last_flushed_index) {
    (Some(point), Some(flushed)) if point.index <= flushed => RecoveryOutcome::FatalCorruption {
      index: point.index,
      reason: point.reason.clone(),
    },
    (Some(point), _) => RecoveryOutcome::TruncatedAtUnflushedTail(point.index),
    (None, Some(flushed)) if last_index.is_some_and(|last| last < flushed) => RecoveryOutcome::FatalCorruption {
      index: last_index.map(|last| last + 1).unwrap_or(1),
      reason: format!("records up to the flushed index {} are missing", flushed),
    },
    (None, _) => RecoveryOutcome::Clean,
  };

  if let RecoveryOutcome::FatalCorruption { .. } = outcome {
    return Ok(Loaded {
      segments: Vec::new(),
      index,
      last_asqn,
      next_segment_id,
      outcome,
    });
  }

  // --- Phase 3: Repair ---
  if let Some(point) = corruption {
    warn!(target: "segjournal", "Truncating unflushed journal tail at index {}: {}", point.index, point.reason);

    if point.keep_segment {
      let segment = &scanned[point.segment];
      let file = fs::OpenOptions::new().write(true).open(&segment.path)?;
      file.set_len(segment.valid_len)?;
      file.sync_all()?;
    }

    let first_removed = if point.keep_segment { point.segment + 1 } else { point.segment };
    for (_, path) in &files[first_removed..] {
      warn!(target: "segjournal", "Removing segment file {} after the truncation point", path.display());
      fs::remove_file(path)?;
    }
    if first_removed < files.len() {
      util::sync_dir(&options.directory)?;
    }
  }

  let segments: Vec<Arc<Segment>> = scanned
    .into_iter()
    .map(|s| Arc::new(Segment::open(s.path, s.descriptor, s.valid_len, s.last_index)))
    .collect();

  info!(
    target: "segjournal",
    "Recovered {} segment(s) from {} (first index: {:?}, last index: {:?}, {} index samples, outcome: {:?})",
    segments.len(),
    options.directory.display(),
    segments.first().map(|s| s.base_index()),
    segments.last().map(|s| s.last_index()),
    index.len(),
    outcome
  );

  Ok(Loaded {
    segments,
    index,
    last_asqn,
    next_segment_id,
    outcome,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{ASQN_IGNORE, JournalRecord};
  use tempfile::TempDir;

  fn write_segment(dir: &Path, id: u64, base: i64, count: i64) -> PathBuf {
    let path = dir.join(util::segment_filename("journal", id));
    let mut bytes = SegmentDescriptor::new(id, base, 1 << 20, Some(base - 1)).encode().to_vec();
    for i in 0..count {
      record::write_record(&mut bytes, &JournalRecord::new(base + i, base + i, b"payload".to_vec())).unwrap();
    }
    fs::write(&path, bytes).unwrap();
    path
  }

  fn options(dir: &TempDir) -> JournalOptions {
    let mut options = JournalOptions::new(dir.path());
    options.index_density = 2;
    options
  }

  #[test]
  fn test_clean_load() {
    let dir = TempDir::new().unwrap();
    write_segment(dir.path(), 1, 1, 5);
    write_segment(dir.path(), 2, 6, 3);
    fs::write(dir.path().join("unrelated.txt"), b"ignored").unwrap();

    let loaded = load(&options(&dir), Some(8)).unwrap();
    assert_eq!(loaded.outcome, RecoveryOutcome::Clean);
    assert_eq!(loaded.segments.len(), 2);
    assert_eq!(loaded.segments[1].last_index(), 8);
    assert_eq!(loaded.last_asqn, Some(8));
    assert_eq!(loaded.next_segment_id, 3);
    assert_eq!(loaded.index.lookup(7).unwrap().index, 6);
  }

  #[test]
  fn test_torn_tail_is_truncated() {
    let dir = TempDir::new().unwrap();
    let path = write_segment(dir.path(), 1, 1, 4);
    let len = fs::metadata(&path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 3).unwrap();
    drop(file);

    let loaded = load(&options(&dir), Some(2)).unwrap();
    assert_eq!(loaded.outcome, RecoveryOutcome::TruncatedAtUnflushedTail(4));
    assert_eq!(loaded.segments[0].last_index(), 3);
    assert_eq!(fs::metadata(&path).unwrap().len(), loaded.segments[0].confirmed_len());
  }

  #[test]
  fn test_damage_below_watermark_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = write_segment(dir.path(), 1, 1, 4);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let loaded = load(&options(&dir), Some(4)).unwrap();
    assert!(matches!(loaded.outcome, RecoveryOutcome::FatalCorruption { index: 4, .. }));
    // Nothing is repaired on a fatal outcome.
    assert_eq!(fs::read(&path).unwrap(), bytes);
  }

  #[test]
  fn test_later_segments_removed_after_damage() {
    let dir = TempDir::new().unwrap();
    write_segment(dir.path(), 1, 1, 3);
    let second = write_segment(dir.path(), 2, 4, 3);
    let third = write_segment(dir.path(), 3, 7, 3);

    let mut bytes = fs::read(&second).unwrap();
    bytes[SegmentDescriptor::SIZE + 20] ^= 0x01; // asqn of index 4
    fs::write(&second, &bytes).unwrap();

    let loaded = load(&options(&dir), None).unwrap();
    assert_eq!(loaded.outcome, RecoveryOutcome::TruncatedAtUnflushedTail(4));
    assert_eq!(loaded.segments.len(), 2);
    assert_eq!(loaded.segments[1].last_index(), 3);
    assert!(!third.exists());
    assert_eq!(loaded.last_asqn, Some(3));
    assert_eq!(loaded.next_segment_id, 4);
  }

  #[test]
  fn test_bad_descriptor_on_unflushed_segment() {
    let dir = TempDir::new().unwrap();
    write_segment(dir.path(), 1, 1, 3);
    let second = write_segment(dir.path(), 2, 4, 0);
    fs::write(&second, [0u8; 10]).unwrap();

    let loaded = load(&options(&dir), Some(3)).unwrap();
    assert_eq!(loaded.outcome, RecoveryOutcome::TruncatedAtUnflushedTail(4));
    assert_eq!(loaded.segments.len(), 1);
    assert!(!second.exists());
  }

  #[test]
  fn test_missing_flushed_records_is_fatal() {
    let dir = TempDir::new().unwrap();
    write_segment(dir.path(), 1, 1, 3);

    let loaded = load(&options(&dir), Some(5)).unwrap();
    assert!(matches!(loaded.outcome, RecoveryOutcome::FatalCorruption { index: 4, .. }));
  }

  #[test]
  fn test_ignored_asqn_does_not_reset_tracker() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(util::segment_filename("journal", 1));
    let mut bytes = SegmentDescriptor::new(1, 1, 1 << 20, None).encode().to_vec();
    record::write_record(&mut bytes, &JournalRecord::new(1, 7, b"a".to_vec())).unwrap();
    record::write_record(&mut bytes, &JournalRecord::new(2, ASQN_IGNORE, b"b".to_vec())).unwrap();
    fs::write(&path, bytes).unwrap();

    let loaded = load(&options(&dir), None).unwrap();
    assert_eq!(loaded.last_asqn, Some(7));
  }

  #[test]
  fn test_first_segment_carries_compacted_asqn() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(util::segment_filename("journal", 4));
    let mut bytes = SegmentDescriptor::new(4, 31, 1 << 20, Some(100)).encode().to_vec();
    record::write_record(&mut bytes, &JournalRecord::new(31, ASQN_IGNORE, b"a".to_vec())).unwrap();
    fs::write(&path, bytes).unwrap();

    let loaded = load(&options(&dir), Some(31)).unwrap();
    assert_eq!(loaded.outcome, RecoveryOutcome::Clean);
    assert_eq!(loaded.last_asqn, Some(100));
  }
}
