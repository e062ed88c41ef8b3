//! # SegJournal
//!
//! `segjournal` is a segmented, append-only journal meant to sit beneath a
//! replicated state machine as its write-ahead storage.
//!
//! Records are addressed by a contiguous, journal-assigned `index` and may
//! carry a caller-supplied, monotonic `asqn` used for content-level seeks.
//!
//! ## Key Features
//!
//! * **Segmented Storage**: Records live in size-bounded segment files that
//!   roll over automatically and can be compacted away from the head.
//! * **Integrity**: Every record carries an xxh3 checksum over its index, asqn
//!   and payload; segment descriptors are CRC32 protected.
//! * **Watermark Recovery**: On open, a damaged tail past the metastore's last
//!   flushed index is truncated, while damage below it is reported as fatal.
//! * **Sparse Index**: Sampled positions bound the cost of every seek.
//! * **Lock-free Readers**: Any number of independent cursors can read while
//!   the journal is appended to, truncated or compacted.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use segjournal::{Journal, JournalOptions, MemoryMetastore};
//!
//! # fn main() -> segjournal::Result<()> {
//! let journal = Journal::open(JournalOptions::new("./journal_data"), Arc::new(MemoryMetastore::new()))?;
//!
//! journal.append(1, b"first")?;
//! journal.append_data(b"no asqn")?;
//! journal.flush()?;
//!
//! let mut reader = journal.open_reader()?;
//! reader.seek_to_asqn(1)?;
//! for record in reader {
//!   let record = record?;
//!   println!("{} -> {} bytes", record.index, record.data.len());
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod descriptor;
mod error;
mod index;
mod journal;
mod metastore;
mod reader;
mod record;
mod segment;
mod util;

// Re-exports for the flat public API
pub use config::{JournalOptions, SyncMode};
pub use error::{Error, Result};
pub use journal::Journal;
pub use metastore::{FileMetastore, MemoryMetastore, Metastore};
pub use reader::JournalReader;
pub use record::{ASQN_IGNORE, JournalRecord, compute_checksum};
