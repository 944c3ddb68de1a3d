//! Out-of-core spill backend.
//!
//! Mirrors `diy::ExternalStorage`: a minimal `{put, get, destroy}` contract
//! over opaque byte buffers, addressed by an opaque handle the storage itself
//! hands back from `put`. The core never interprets the handle; it only
//! stores it in a `QueueRecord` or a collection slot until the data is needed
//! again.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// An opaque handle returned by `Storage::put`. `-1` is reserved by callers
/// (see `QueueRecord`) to mean "not spilled"; a real storage backend never
/// hands back `-1`.
pub type StorageHandle = i64;

pub trait Storage: Send + Sync {
    /// Writes `buf` to the backend and returns a handle usable to retrieve it
    /// later. Takes ownership of the bytes the way `ExternalStorage::put`
    /// swaps them out of the caller's buffer.
    fn put(&self, buf: Vec<u8>) -> Result<StorageHandle>;

    /// Reads back the bytes written under `handle` and releases the slot,
    /// matching `ExternalStorage::get`'s move-out-and-forget semantics.
    fn get(&self, handle: StorageHandle) -> Result<Vec<u8>>;

    /// Releases a handle's storage without reading it back, used when a
    /// spilled record is dropped rather than reloaded (e.g. `Collection::clear`).
    fn destroy(&self, handle: StorageHandle) -> Result<()>;

    /// Bytes currently held by the backend, exposed for test assertions and
    /// for the resource-exhaustion accounting in `Collection`.
    fn size(&self) -> u64;
}

/// An in-process backend that spills to one file per handle inside a
/// `tempfile::TempDir`. The directory is removed when the `FileStorage` (and
/// therefore every handle it issued) is dropped, matching the original's
/// "files are scratch space for the lifetime of the run" contract.
pub struct FileStorage {
    dir: tempfile::TempDir,
    next: AtomicI64,
    sizes: Mutex<HashMap<StorageHandle, u64>>,
}

impl FileStorage {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().map_err(Error::Storage)?;
        Ok(FileStorage {
            dir,
            next: AtomicI64::new(0),
            sizes: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, handle: StorageHandle) -> std::path::PathBuf {
        self.dir.path().join(format!("block-{handle:020}.bin"))
    }
}

impl Storage for FileStorage {
    fn put(&self, buf: Vec<u8>) -> Result<StorageHandle> {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        let mut f = std::fs::File::create(self.path_for(handle)).map_err(Error::Storage)?;
        f.write_all(&buf).map_err(Error::Storage)?;
        self.sizes.lock().unwrap().insert(handle, buf.len() as u64);
        Ok(handle)
    }

    fn get(&self, handle: StorageHandle) -> Result<Vec<u8>> {
        let path = self.path_for(handle);
        let mut buf = Vec::new();
        std::fs::File::open(&path)
            .map_err(Error::Storage)?
            .read_to_end(&mut buf)
            .map_err(Error::Storage)?;
        std::fs::remove_file(&path).map_err(Error::Storage)?;
        self.sizes.lock().unwrap().remove(&handle);
        Ok(buf)
    }

    fn destroy(&self, handle: StorageHandle) -> Result<()> {
        let path = self.path_for(handle);
        std::fs::remove_file(&path).map_err(Error::Storage)?;
        self.sizes.lock().unwrap().remove(&handle);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.sizes.lock().unwrap().values().sum()
    }
}

/// A backend that never actually leaves memory, used in tests that want
/// spill bookkeeping exercised without touching the filesystem.
#[derive(Default)]
pub struct MemoryStorage {
    next: AtomicI64,
    slots: Mutex<HashMap<StorageHandle, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn put(&self, buf: Vec<u8>) -> Result<StorageHandle> {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().unwrap().insert(handle, buf);
        Ok(handle)
    }

    fn get(&self, handle: StorageHandle) -> Result<Vec<u8>> {
        self.slots
            .lock()
            .unwrap()
            .remove(&handle)
            .ok_or(Error::IexchangeProtocol(format!("no storage slot for handle {handle}")))
    }

    fn destroy(&self, handle: StorageHandle) -> Result<()> {
        self.slots.lock().unwrap().remove(&handle);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.slots.lock().unwrap().values().map(|b| b.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_roundtrip() {
        let storage = FileStorage::new().unwrap();
        let handle = storage.put(vec![1, 2, 3, 4]).unwrap();
        assert_eq!(storage.size(), 4);
        let back = storage.get(handle).unwrap();
        assert_eq!(back, vec![1, 2, 3, 4]);
        assert_eq!(storage.size(), 0);
    }

    #[test]
    fn memory_storage_destroy_without_read() {
        let storage = MemoryStorage::new();
        let handle = storage.put(vec![9; 16]).unwrap();
        storage.destroy(handle).unwrap();
        assert!(storage.get(handle).is_err());
    }
}
