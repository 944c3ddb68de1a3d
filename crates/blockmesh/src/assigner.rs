//! Gid-to-rank assignment. Grounded on `diy::StaticAssigner`/`diy::DynamicAssigner`:
//! the core only ever needs "which rank owns this gid" and "how many blocks does
//! this rank own"; everything else (decomposition, balancing) builds on top.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::block::{Gid, Proc};

/// Maps gids to owning ranks. Implementations must agree across all ranks
/// about every `rank(gid)` answer at any given moment — that agreement is
/// exactly what `Master::fix_links` plus a balancing protocol's bookkeeping
/// is responsible for keeping true after blocks move.
pub trait Assigner: Send + Sync {
    fn rank(&self, gid: Gid) -> Proc;
    fn nblocks(&self) -> usize;
    fn local_gids(&self, rank: Proc) -> Vec<Gid>;
}

/// Blocks `0..nblocks` spread round-robin over `nranks` ranks: gid `g` lives
/// on rank `g % nranks`. Never changes after construction.
pub struct RoundRobinAssigner {
    nblocks: usize,
    nranks: Proc,
}

impl RoundRobinAssigner {
    pub fn new(nblocks: usize, nranks: Proc) -> Self {
        RoundRobinAssigner { nblocks, nranks }
    }
}

impl Assigner for RoundRobinAssigner {
    fn rank(&self, gid: Gid) -> Proc {
        (gid % self.nranks as Gid) as Proc
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn local_gids(&self, rank: Proc) -> Vec<Gid> {
        (0..self.nblocks as Gid).filter(|&g| self.rank(g) == rank).collect()
    }
}

/// Blocks `0..nblocks` split into `nranks` contiguous runs, as equal as
/// `nblocks % nranks` allows (the first `nblocks % nranks` ranks get one
/// extra block). Never changes after construction.
pub struct ContiguousAssigner {
    nblocks: usize,
    nranks: Proc,
}

impl ContiguousAssigner {
    pub fn new(nblocks: usize, nranks: Proc) -> Self {
        ContiguousAssigner { nblocks, nranks }
    }

    fn bounds(&self, rank: Proc) -> (usize, usize) {
        let nranks = self.nranks as usize;
        let base = self.nblocks / nranks;
        let extra = self.nblocks % nranks;
        let rank = rank as usize;
        let start = rank * base + rank.min(extra);
        let len = base + if rank < extra { 1 } else { 0 };
        (start, start + len)
    }
}

impl Assigner for ContiguousAssigner {
    fn rank(&self, gid: Gid) -> Proc {
        let nranks = self.nranks as usize;
        let base = self.nblocks / nranks;
        let extra = self.nblocks % nranks;
        let gid = gid as usize;
        let boundary = extra * (base + 1);
        let rank = if gid < boundary { gid / (base + 1) } else { extra + (gid - boundary) / base.max(1) };
        rank as Proc
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn local_gids(&self, rank: Proc) -> Vec<Gid> {
        let (start, end) = self.bounds(rank);
        (start as Gid..end as Gid).collect()
    }
}

/// Mutable gid→rank table, updated as load-balancing moves blocks around.
/// Starts from a static assignment and is mutated in place by
/// `set_rank`/`crate::balance`, mirroring `diy::DynamicAssigner`.
pub struct DynamicAssigner {
    table: RwLock<HashMap<Gid, Proc>>,
    nblocks: usize,
}

impl DynamicAssigner {
    pub fn from_static(initial: &dyn Assigner, nranks: Proc) -> Self {
        let mut table = HashMap::new();
        for rank in 0..nranks {
            for gid in initial.local_gids(rank) {
                table.insert(gid, rank);
            }
        }
        DynamicAssigner { table: RwLock::new(table), nblocks: initial.nblocks() }
    }

    pub fn set_rank(&self, gid: Gid, rank: Proc) {
        self.table.write().expect("assigner lock poisoned").insert(gid, rank);
    }
}

impl Assigner for DynamicAssigner {
    fn rank(&self, gid: Gid) -> Proc {
        *self.table.read().expect("assigner lock poisoned").get(&gid).expect("gid registered at construction")
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn local_gids(&self, rank: Proc) -> Vec<Gid> {
        self.table.read().expect("assigner lock poisoned").iter().filter(|&(_, &r)| r == rank).map(|(&g, _)| g).collect()
    }
}
