//! Local block storage with lazy spill to external storage.
//!
//! Mirrors `diy::Collection`: blocks live behind a `Lid` (process-local
//! index), are created/saved/loaded through `BlockOps`, and can be unloaded
//! to free in-memory budget without losing the gid→lid mapping the rest of
//! the core relies on.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{BlockOps, Gid, Lid};
use crate::error::{Error, Result};
use crate::storage::Storage;

enum Slot<B> {
    Resident(B),
    Spilled { handle: crate::storage::StorageHandle, byte_size: usize },
}

struct Entry<B> {
    gid: Gid,
    slot: Slot<B>,
}

/// The process-local block set for one `Master`.
pub struct Collection<B> {
    entries: Vec<Option<Entry<B>>>,
    ops: BlockOps<B>,
    in_memory: AtomicUsize,
}

impl<B> Collection<B> {
    pub fn new(ops: BlockOps<B>) -> Self {
        Collection { entries: Vec::new(), ops, in_memory: AtomicUsize::new(0) }
    }

    /// Registers a resident block, returning its `lid`.
    pub fn add(&mut self, gid: Gid, block: B) -> Lid {
        let lid = self.entries.len();
        self.entries.push(Some(Entry { gid, slot: Slot::Resident(block) }));
        self.in_memory.fetch_add(1, Ordering::Relaxed);
        lid
    }

    /// Removes a block entirely, reloading it from external storage first if
    /// it was spilled, and returns its payload. Ownership transfers out to
    /// the caller either way (`diy::Collection::release` reloads via `get()`
    /// before returning rather than dropping a spilled block unread).
    pub fn release(&mut self, lid: Lid, storage: &dyn Storage) -> Result<B> {
        let entry = self
            .entries
            .get_mut(lid)
            .ok_or(Error::UnknownLid(lid))?
            .take()
            .ok_or(Error::UnknownLid(lid))?;
        match entry.slot {
            Slot::Resident(block) => {
                self.in_memory.fetch_sub(1, Ordering::Relaxed);
                Ok(block)
            }
            Slot::Spilled { handle, .. } => {
                let bytes = storage.get(handle)?;
                storage.destroy(handle)?;
                let mut block = self.ops.create();
                self.ops.load(&mut block, &bytes);
                Ok(block)
            }
        }
    }

    pub fn gid(&self, lid: Lid) -> Result<Gid> {
        self.entries.get(lid).and_then(|e| e.as_ref()).map(|e| e.gid).ok_or(Error::UnknownLid(lid))
    }

    pub fn find(&self, gid: Gid) -> Option<Lid> {
        self.entries.iter().position(|e| matches!(e, Some(entry) if entry.gid == gid))
    }

    pub fn is_resident(&self, lid: Lid) -> Result<bool> {
        match self.entries.get(lid).and_then(|e| e.as_ref()) {
            Some(entry) => Ok(matches!(entry.slot, Slot::Resident(_))),
            None => Err(Error::UnknownLid(lid)),
        }
    }

    /// Loads the block at `lid` if spilled, and returns a reference to it.
    pub fn get(&mut self, lid: Lid, storage: &dyn Storage) -> Result<&B> {
        self.load(lid, storage)?;
        match &self.entries[lid] {
            Some(Entry { slot: Slot::Resident(block), .. }) => Ok(block),
            _ => unreachable!("load() guarantees residency"),
        }
    }

    pub fn get_mut(&mut self, lid: Lid, storage: &dyn Storage) -> Result<&mut B> {
        self.load(lid, storage)?;
        match &mut self.entries[lid] {
            Some(Entry { slot: Slot::Resident(block), .. }) => Ok(block),
            _ => unreachable!("load() guarantees residency"),
        }
    }

    pub fn load(&mut self, lid: Lid, storage: &dyn Storage) -> Result<()> {
        let entry = self.entries.get_mut(lid).ok_or(Error::UnknownLid(lid))?.as_mut().ok_or(Error::UnknownLid(lid))?;
        let handle = match entry.slot {
            Slot::Resident(_) => return Ok(()),
            Slot::Spilled { handle, .. } => handle,
        };
        tracing::debug!(lid, "loading spilled block");
        let bytes = storage.get(handle)?;
        let mut block = self.ops.create();
        self.ops.load(&mut block, &bytes);
        entry.slot = Slot::Resident(block);
        self.in_memory.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn unload(&mut self, lid: Lid, storage: &dyn Storage) -> Result<()> {
        let entry = self.entries.get_mut(lid).ok_or(Error::UnknownLid(lid))?.as_mut().ok_or(Error::UnknownLid(lid))?;
        let block = match &entry.slot {
            Slot::Resident(block) => block,
            Slot::Spilled { .. } => return Ok(()),
        };
        let mut buf = Vec::new();
        self.ops.save(block, &mut buf);
        let byte_size = buf.len();
        tracing::debug!(lid, byte_size, "unloading block to external storage");
        let handle = storage.put(buf)?;
        entry.slot = Slot::Spilled { handle, byte_size };
        self.in_memory.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Bulk-unloads `lids` in order, stopping early on the first storage
    /// failure (fatal per the spill/restore contract).
    pub fn unload_many(&mut self, lids: &[Lid], storage: &dyn Storage) -> Result<()> {
        for &lid in lids {
            self.unload(lid, storage)?;
        }
        Ok(())
    }

    /// Serializes the block at `lid` via `BlockOps::save`, loading it first
    /// if it was spilled. Used for the load-balance wire transfer, which
    /// needs raw bytes rather than a live reference.
    pub(crate) fn export_bytes(&mut self, lid: Lid, storage: &dyn Storage) -> Result<Vec<u8>> {
        self.load(lid, storage)?;
        let entry = self.entries.get(lid).and_then(|e| e.as_ref()).ok_or(Error::UnknownLid(lid))?;
        let mut buf = Vec::new();
        match &entry.slot {
            Slot::Resident(block) => self.ops.save(block, &mut buf),
            Slot::Spilled { .. } => unreachable!("load() guarantees residency"),
        }
        Ok(buf)
    }

    /// Builds a fresh block from wire bytes via `BlockOps::create`/`load`,
    /// the receiving half of the load-balance wire transfer.
    pub(crate) fn import_block(&self, bytes: &[u8]) -> B {
        let mut block = self.ops.create();
        self.ops.load(&mut block, bytes);
        block
    }

    pub fn in_memory(&self) -> usize {
        self.in_memory.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident lids first, then spilled — the ordering `execute()` wants so
    /// the already-warm working set is processed before anything that
    /// requires a load.
    pub fn ordered_lids(&self) -> Vec<Lid> {
        let mut resident = Vec::new();
        let mut spilled = Vec::new();
        for (lid, entry) in self.entries.iter().enumerate() {
            match entry {
                Some(Entry { slot: Slot::Resident(_), .. }) => resident.push(lid),
                Some(Entry { slot: Slot::Spilled { .. }, .. }) => spilled.push(lid),
                None => {}
            }
        }
        resident.extend(spilled);
        resident
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn ops() -> BlockOps<i32> {
        BlockOps::new(|| 0, |b, buf| buf.extend(b.to_le_bytes()), |b, bytes| *b = i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    #[test]
    fn unload_then_load_roundtrips() {
        let storage = MemoryStorage::new();
        let mut coll = Collection::new(ops());
        let lid = coll.add(7, 42);
        coll.unload(lid, &storage).unwrap();
        assert!(!coll.is_resident(lid).unwrap());
        assert_eq!(coll.in_memory(), 0);
        let value = *coll.get(lid, &storage).unwrap();
        assert_eq!(value, 42);
        assert!(coll.is_resident(lid).unwrap());
    }

    #[test]
    fn release_spilled_reloads_then_destroys_the_handle() {
        let storage = MemoryStorage::new();
        let mut coll = Collection::new(ops());
        let lid = coll.add(1, 99);
        coll.unload(lid, &storage).unwrap();
        assert_eq!(coll.release(lid, &storage).unwrap(), 99);
        assert_eq!(storage.size(), 0);
    }

    #[test]
    fn find_by_gid() {
        let mut coll = Collection::new(ops());
        coll.add(10, 1);
        let lid = coll.add(20, 2);
        assert_eq!(coll.find(20), Some(lid));
        assert_eq!(coll.find(99), None);
    }
}
