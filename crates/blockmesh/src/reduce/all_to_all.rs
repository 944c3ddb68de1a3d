//! All-to-all exchange built on the `Swap` partner schedule: a recursive
//! doubling shuffle where, round by round, each block's accumulated bag of
//! items is exchanged with an ever-larger contiguous group until, after the
//! last round, every block holds the union of what every other block
//! produced. Grounded on `diy::all_to_all` / `AllToAllReduce`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::assigner::Assigner;
use crate::block::Gid;
use crate::error::Result;
use crate::master::Master;

use super::exchange_round;
use super::partners::{Partners, RegularPartners, Swap};

/// One item produced for (eventually) delivery to `target`, tagged with the
/// contiguous gid range `[first, last]` it was last folded from so a
/// receiver can restore gid order without re-sorting every round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeItem {
    pub target: Gid,
    pub first: Gid,
    pub last: Gid,
    pub bytes: Vec<u8>,
}

impl RangeItem {
    pub fn singleton(target: Gid, source: Gid, bytes: Vec<u8>) -> Self {
        RangeItem { target, first: source, last: source, bytes }
    }
}

/// The `Swap` schedule an all-to-all shuffle rides on top of: a single
/// dimension of size `nblocks`, factored by `k`.
pub struct AllToAllReduce {
    swap: Swap,
}

impl AllToAllReduce {
    pub fn new(nblocks: usize, k: usize) -> Self {
        let partners = RegularPartners::new(vec![nblocks], k, true);
        AllToAllReduce { swap: Swap::new(partners) }
    }

    pub fn rounds(&self) -> usize {
        self.swap.rounds()
    }
}

/// Runs a full all-to-all shuffle: `produce` is called once per local block
/// up front to seed its bag of `RangeItem`s (each tagged with its eventual
/// `target`); `consume` is called once per local block at the end with the
/// complete, fully-connected set of items every block produced. `k` controls
/// the shuffle's branching factor the same way it does for `RegularPartners`.
pub fn all_to_all<B, Bounds>(
    master: &mut Master<B, Bounds>,
    assigner: &dyn Assigner,
    mut produce: impl FnMut(&mut B, Gid) -> Vec<RangeItem>,
    mut consume: impl FnMut(&mut B, &[RangeItem]),
    k: usize,
) -> Result<()> {
    let scheme = AllToAllReduce::new(assigner.nblocks(), k);
    let storage = master.storage().clone();
    let lids = master.collection_mut().ordered_lids();
    let mut gids = Vec::with_capacity(lids.len());
    for &lid in &lids {
        gids.push(master.gid(lid)?);
    }

    let mut bag: HashMap<Gid, Vec<RangeItem>> = HashMap::new();
    for (&lid, &gid) in lids.iter().zip(gids.iter()) {
        let block = master.collection_mut().get_mut(lid, storage.as_ref())?;
        bag.insert(gid, produce(&mut *block, gid));
    }

    let rounds = scheme.rounds();
    let nblocks = assigner.nblocks();
    let mut inbox: HashMap<Gid, HashMap<Gid, Vec<RangeItem>>> = HashMap::new();

    for round in 0..rounds {
        let mut outbox: HashMap<Gid, HashMap<Gid, Vec<RangeItem>>> = HashMap::new();
        for &gid in &gids {
            if let Some(delivered) = inbox.remove(&gid) {
                let local_bag = bag.entry(gid).or_default();
                for (_from, mut items) in delivered {
                    local_bag.append(&mut items);
                }
            }
            let mut peers = Vec::new();
            scheme.swap.outgoing(round, gid, nblocks, &mut peers);
            let snapshot = bag.get(&gid).cloned().unwrap_or_default();
            for &peer in &peers {
                if peer == gid {
                    continue;
                }
                outbox.entry(peer).or_default().insert(gid, snapshot.clone());
            }
        }
        exchange_round(master, assigner, outbox, &mut inbox)?;
    }

    for &gid in &gids {
        if let Some(delivered) = inbox.remove(&gid) {
            let local_bag = bag.entry(gid).or_default();
            for (_from, mut items) in delivered {
                local_bag.append(&mut items);
            }
        }
    }

    for (&lid, gid) in lids.iter().zip(gids.iter()) {
        let items = bag.remove(gid).unwrap_or_default();
        let block = master.collection_mut().get_mut(lid, storage.as_ref())?;
        consume(&mut *block, &items);
    }
    Ok(())
}
