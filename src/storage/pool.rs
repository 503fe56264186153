//! Shared store: one writer connection plus a small round-robin pool of
//! read-only connections. Reads share the gate, writes hold it exclusively.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::storage::sqlite::Database;

const MAX_READERS: usize = 8;

pub struct Store {
    writer: Mutex<Database>,
    readers: Vec<Mutex<Database>>,
    next: AtomicUsize,
    gate: RwLock<()>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("readers", &self.readers.len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (and migrate) the database file, then attach `read_pool_size`
    /// read-only connections.
    pub fn open(path: impl AsRef<Path>, read_pool_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let writer = Database::open(path)?;

        let size = read_pool_size.min(MAX_READERS);
        let mut readers = Vec::with_capacity(size);
        for _ in 0..size {
            readers.push(Mutex::new(Database::open_read_only(path)?));
        }

        tracing::debug!(path = %path.display(), readers = size, "store opened");
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next: AtomicUsize::new(0),
            gate: RwLock::new(()),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory store. Reads go through the writer connection.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            writer: Mutex::new(Database::open_in_memory()?),
            readers: Vec::new(),
            next: AtomicUsize::new(0),
            gate: RwLock::new(()),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Run `f` against a read connection.
    pub fn read<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let _shared = self.gate.read();
        if self.readers.is_empty() {
            return f(&self.writer.lock());
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        f(&self.readers[idx].lock())
    }

    /// Run `f` against the single writer connection.
    pub fn write<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let _exclusive = self.gate.write();
        f(&self.writer.lock())
    }
}
