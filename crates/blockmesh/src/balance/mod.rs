//! Dynamic load balancing: move blocks between ranks to even out `proc_work`.
//! Grounded on `diy::decomposition`'s collective and sampling balancers.
//! Both variants share the same `WorkInfo`/`MoveInfo` bookkeeping and the
//! same wire transfer for relocating a block; they differ only in how they
//! decide which moves to make (§4.6).

pub mod collective;
pub mod sampling;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::assigner::DynamicAssigner;
use crate::block::{Gid, Proc};
use crate::comm::Tag;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::master::Master;

/// One rank's work snapshot, as all-gathered (collective variant) or
/// exchanged point-to-point (sampling variant).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct WorkInfo {
    pub rank: Proc,
    pub top_gid: Gid,
    pub top_work: f64,
    pub proc_work: f64,
    pub nlocal_blocks: usize,
}

/// A single decided relocation: `gid` moves from `from` to `to`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveInfo {
    pub gid: Gid,
    pub from: Proc,
    pub to: Proc,
}

/// This rank's `WorkInfo`: `work` applied to every local block, the
/// heaviest one remembered as the sampling/collective candidate to move.
pub(crate) fn local_work_info<B, Bounds>(master: &mut Master<B, Bounds>, work: &impl Fn(&B) -> f64) -> Result<WorkInfo> {
    let rank = master.comm().rank();
    let storage = master.storage().clone();
    let lids = master.collection_mut().ordered_lids();
    let mut top_gid = Gid::default();
    let mut top_work = f64::MIN;
    let mut proc_work = 0.0;
    for lid in &lids {
        let gid = master.gid(*lid)?;
        let w = work(master.collection_mut().get(*lid, storage.as_ref())?);
        proc_work += w;
        if w > top_work {
            top_work = w;
            top_gid = gid;
        }
    }
    Ok(WorkInfo { rank, top_gid, top_work: top_work.max(0.0), proc_work, nlocal_blocks: lids.len() })
}

/// The wire form of one block move: the serialized block (via the
/// destination's own `BlockOps`, so `B` never needs to implement `serde`
/// traits itself) plus its serialized link. `predicted_work` and `origin`
/// are carried for diagnostics even though this substrate delivers moves
/// synchronously and never needs to reconcile a stale prediction.
#[derive(serde::Serialize, serde::Deserialize)]
struct BlockTransfer<Bounds> {
    gid: Gid,
    predicted_work: f64,
    origin: Proc,
    block_bytes: Vec<u8>,
    link: Link<Bounds>,
}

/// Executes every move in `moves` this rank is a source or destination for,
/// applies the new ownership to `assigner` on every rank (all ranks compute
/// the same `moves` from the same gathered `WorkInfo`, so every rank updates
/// its assigner identically without a further broadcast), and calls
/// `Master::fix_links` once the wave settles.
#[tracing::instrument(level = "debug", skip(master, assigner))]
pub fn apply_moves<B, Bounds>(master: &mut Master<B, Bounds>, assigner: &DynamicAssigner, moves: &[MoveInfo]) -> Result<()>
where
    Bounds: Serialize + DeserializeOwned + Clone,
{
    let own_rank = master.comm().rank();
    let mut moved: HashMap<Gid, Proc> = HashMap::new();

    for mv in moves {
        tracing::info!(gid = mv.gid, from = mv.from, to = mv.to, "load-balance move");
        moved.insert(mv.gid, mv.to);
        if mv.from == own_rank {
            send_block::<B, Bounds>(master, mv.gid, mv.to)?;
        } else if mv.to == own_rank {
            recv_block::<B, Bounds>(master)?;
        }
        assigner.set_rank(mv.gid, mv.to);
    }

    master.fix_links(&moved);
    Ok(())
}

fn send_block<B, Bounds>(master: &mut Master<B, Bounds>, gid: Gid, dest: Proc) -> Result<()>
where
    Bounds: Serialize + Clone,
{
    let lid = master.lid(gid)?;
    let link = master.link(lid)?.clone();
    let storage = master.storage().clone();
    let block_bytes = master.collection_mut().export_bytes(lid, storage.as_ref())?;
    let transfer = BlockTransfer { gid, predicted_work: 0.0, origin: master.comm().rank(), block_bytes, link };
    let payload = bincode::serialize(&transfer).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut req = master.comm().issend(dest, Tag::Queue, payload);
    req.wait();
    // The sender only drops the block from its Collection after the payload
    // is fully enqueued, per the transfer's atomicity contract (§4.6).
    master.release(lid)?;
    Ok(())
}

fn recv_block<B, Bounds>(master: &mut Master<B, Bounds>) -> Result<()>
where
    Bounds: DeserializeOwned,
{
    let mut req = master.comm().irecv_any(Tag::Queue);
    req.wait();
    let (_src, payload) = req.take();
    let transfer: BlockTransfer<Bounds> =
        bincode::deserialize(&payload).map_err(|e| Error::Deserialization(e.to_string()))?;
    let block = master.collection_mut().import_block(&transfer.block_bytes);
    master.add(transfer.gid, block, transfer.link);
    Ok(())
}
