use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("I/O Error: {0}")]
  Io(#[from] io::Error),

  #[error("Invalid index: expected {expected}, got {actual}")]
  InvalidIndex { expected: i64, actual: i64 },

  #[error("No index left to assign after {last}")]
  IndexOverflow { last: i64 },

  #[error("Checksum mismatch for record {index}: expected {expected:#018x}, got {actual:#018x}")]
  InvalidChecksum { index: i64, expected: u64, actual: u64 },

  #[error("Invalid asqn: {actual} is not greater than the last asqn {last}")]
  InvalidAsqn { last: i64, actual: i64 },

  #[error("Journal corrupted at index {index}: {reason}")]
  CorruptedJournal { index: i64, reason: String },

  #[error("Data Corruption: {0}")]
  Corruption(String),

  #[error("Record of {size} bytes can never fit a segment of {max} bytes")]
  RecordTooLarge { size: u64, max: u64 },

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Journal is closed")]
  Closed,
}
