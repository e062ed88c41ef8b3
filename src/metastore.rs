use crate::error::{Error, Result};
use crate::util;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Durable record of the last flushed journal index.
///
/// The journal treats the stored value as its durability watermark: corruption
/// at or below it is fatal during recovery, corruption above it is an
/// incomplete write and is truncated away.
pub trait Metastore: Send + Sync {
  fn store_last_flushed_index(&self, index: i64) -> Result<()>;

  /// Returns `None` if no index was ever stored (or it was reset).
  fn load_last_flushed_index(&self) -> Result<Option<i64>>;

  fn reset_last_flushed_index(&self) -> Result<()>;
}

/// A metastore that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryMetastore {
  last_flushed_index: Mutex<Option<i64>>,
}

impl MemoryMetastore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Metastore for MemoryMetastore {
  fn store_last_flushed_index(&self, index: i64) -> Result<()> {
    *self.last_flushed_index.lock() = Some(index);
    Ok(())
  }

  fn load_last_flushed_index(&self) -> Result<Option<i64>> {
    Ok(*self.last_flushed_index.lock())
  }

  fn reset_last_flushed_index(&self) -> Result<()> {
    *self.last_flushed_index.lock() = None;
    Ok(())
  }
}

/// A metastore persisted in a single small file.
///
/// Layout: [Version: 1][Last Flushed Index: 8][CRC32: 4]
///
/// Every store replaces the file atomically (temp file, rename, directory fsync).
#[derive(Debug)]
pub struct FileMetastore {
  path: PathBuf,
  // Serializes writers sharing the temp file.
  write_lock: Mutex<()>,
}

impl FileMetastore {
  pub const VERSION: u8 = 1;

  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      write_lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn dir(&self) -> &Path {
    match self.path.parent() {
      Some(p) if !p.as_os_str().is_empty() => p,
      _ => Path::new("."),
    }
  }

  fn checksum(version: u8, index: i64) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[version]);
    hasher.update(&index.to_le_bytes());
    hasher.finalize()
  }
}

impl Metastore for FileMetastore {
  fn store_last_flushed_index(&self, index: i64) -> Result<()> {
    let _guard = self.write_lock.lock();

    let mut temp_name = self.path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = self.path.with_file_name(temp_name);

    // 1. Write to a temporary file
    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_u8(Self::VERSION)?;
    writer.write_i64::<LittleEndian>(index)?;
    writer.write_u32::<LittleEndian>(Self::checksum(Self::VERSION, index))?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    // 2. Atomically rename the temp file to the final name
    fs::rename(&temp_path, &self.path)?;

    // 3. fsync the parent directory to ensure the rename is persisted
    util::sync_dir(self.dir())
  }

  fn load_last_flushed_index(&self) -> Result<Option<i64>> {
    let file = match File::open(&self.path) {
      Ok(f) => f,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(Error::Io(e)),
    };
    let mut reader = BufReader::new(file);

    let version = reader.read_u8()?;
    if version != Self::VERSION {
      return Err(Error::Corruption(format!(
        "Unsupported metastore version: expected {}, got {}",
        Self::VERSION,
        version
      )));
    }

    let index = reader.read_i64::<LittleEndian>()?;
    let stored = reader.read_u32::<LittleEndian>()?;
    let actual = Self::checksum(version, index);
    if stored != actual {
      return Err(Error::Corruption(format!(
        "Metastore checksum mismatch: expected {:#x}, got {:#x}",
        stored, actual
      )));
    }

    Ok(Some(index))
  }

  fn reset_last_flushed_index(&self) -> Result<()> {
    let _guard = self.write_lock.lock();
    match fs::remove_file(&self.path) {
      Ok(()) => util::sync_dir(self.dir()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(Error::Io(e)),
    }
  }
}
