//! The block identifier types and the type-erasure boundary for user payloads.
//!
//! The original implementation threads a `void*` block through the core
//! alongside four function pointers `{create, destroy, save, load}` so that
//! the core never depends on the payload's shape. Rust's generics give the
//! same separation without unsafe pointer erasure: `Master<B>` is generic
//! over the block type, and `destroy` is simply `B`'s `Drop` impl rather than
//! a fourth function pointer (see DESIGN.md).

use std::sync::Arc;

/// A global block id, unique across all ranks. `0..N` for `N` total blocks.
pub type Gid = i64;

/// An MPI-style rank.
pub type Proc = i32;

/// A process-local index into a `Collection`.
pub type Lid = usize;

/// The pair `{gid, proc}` identifying a block and its current owning rank.
///
/// Equality and ordering are defined purely in terms of `gid`, matching
/// `diy::BlockID`: two `BlockId`s with the same `gid` but different `proc`
/// compare equal, which is what lets `Link::target` entries be deduplicated
/// by `size_unique()` even while they disagree transiently about ownership
/// during a migration wave.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct BlockId {
    pub gid: Gid,
    pub proc: Proc,
}

impl PartialEq for BlockId {
    fn eq(&self, other: &Self) -> bool {
        self.gid == other.gid
    }
}
impl Eq for BlockId {}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.gid.cmp(&other.gid)
    }
}

impl std::hash::Hash for BlockId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.gid.hash(state);
    }
}

/// Save/load functions for a block payload, supplied once at `Master`
/// construction. `create` backs the default-block path used when
/// deserializing a freshly-received or migrated block; `save`/`load` are the
/// core's only window into the payload's bytes.
///
/// Cloning a `BlockOps` is cheap (it's three `Arc`s); every `Master` that
/// shares a block type typically shares one `BlockOps` instance.
pub struct BlockOps<B> {
    create: Arc<dyn Fn() -> B + Send + Sync>,
    save: Arc<dyn Fn(&B, &mut Vec<u8>) + Send + Sync>,
    load: Arc<dyn Fn(&mut B, &[u8]) + Send + Sync>,
}

impl<B> Clone for BlockOps<B> {
    fn clone(&self) -> Self {
        BlockOps {
            create: self.create.clone(),
            save: self.save.clone(),
            load: self.load.clone(),
        }
    }
}

impl<B> BlockOps<B> {
    pub fn new(
        create: impl Fn() -> B + Send + Sync + 'static,
        save: impl Fn(&B, &mut Vec<u8>) + Send + Sync + 'static,
        load: impl Fn(&mut B, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        BlockOps {
            create: Arc::new(create),
            save: Arc::new(save),
            load: Arc::new(load),
        }
    }

    pub fn create(&self) -> B {
        (self.create)()
    }

    pub fn save(&self, block: &B, buf: &mut Vec<u8>) {
        (self.save)(block, buf)
    }

    pub fn load(&self, block: &mut B, buf: &[u8]) {
        (self.load)(block, buf)
    }
}

/// Convenience constructor for blocks that implement `serde`'s traits, the
/// common case in tests and examples.
impl<B> BlockOps<B>
where
    B: serde::Serialize + serde::de::DeserializeOwned + Default + Send + Sync + 'static,
{
    pub fn bincode() -> Self {
        BlockOps::new(
            B::default,
            |b, buf| buf.extend(bincode::serialize(b).expect("block serialization is infallible for in-memory types")),
            |b, bytes| *b = bincode::deserialize(bytes).expect("block deserialization failed"),
        )
    }
}
