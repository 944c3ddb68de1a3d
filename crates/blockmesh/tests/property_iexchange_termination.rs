//! P3 — termination of iexchange: for any per-block particle count and hop
//! budget, a one-directional bounce chain drives every particle's hop
//! budget to zero and `iexchange` returns, with a merge-reduce afterward
//! confirming the particle/hop budget was conserved exactly.

use std::sync::Arc;

use blockmesh::{reduce, BlockId, BlockOps, Communicator, HoldPolicy, Link, LocalCommunicator, Master, MasterConfig, MemoryStorage, Merge, RegularPartners, RoundRobinAssigner, Variant};
use proptest::prelude::*;

#[derive(Clone, Default)]
struct BounceBlock {
    live: Vec<u32>,
    expected_particles: u64,
    finished_particles: u64,
    expected_hops: u64,
    finished_hops: u64,
    idle_ticks: u32,
}

type Tally = (u64, u64, u64, u64);

fn ops() -> BlockOps<BounceBlock> {
    BlockOps::new(BounceBlock::default, |_, _| {}, |_, _| {})
}

/// `seeds[i]` is `(particles, hops)` for block `i`, chained one-directionally
/// `0 -> 1 -> ... -> n-1`. Returns `(expected_particles, finished_particles,
/// expected_hops, finished_hops)` totaled across all blocks.
fn run_bounce_chain(seeds: &[(u32, u32)]) -> Tally {
    let n = seeds.len() as i64;
    let comm: Arc<dyn Communicator> = LocalCommunicator::new_group(1).remove(0);
    let storage = Arc::new(MemoryStorage::new());
    let mut master: Master<BounceBlock, ()> = Master::new(comm, storage, ops(), MasterConfig { in_memory_limit: 0, threads: 1, ..Default::default() });

    for (gid, &(particles, hops)) in seeds.iter().enumerate() {
        let gid = gid as i64;
        let mut link = Link::new();
        if gid + 1 < n {
            link.add_neighbor(BlockId { gid: gid + 1, proc: 0 });
        }
        let live = vec![hops; particles as usize];
        master.add(
            gid,
            BounceBlock {
                live,
                expected_particles: particles as u64,
                expected_hops: particles as u64 * hops as u64,
                ..Default::default()
            },
            link,
        );
    }

    master
        .iexchange(Variant::CollectiveBarrier, HoldPolicy::default(), |block, proxy| {
            let neighbors: Vec<i64> = proxy.link().neighbors().iter().map(|n| n.gid).collect();
            for nbr in &neighbors {
                if let Ok(Some(incoming)) = proxy.dequeue_value::<Vec<u32>>(*nbr) {
                    block.live.extend(incoming);
                }
            }
            let live = std::mem::take(&mut block.live);
            let mut to_forward = Vec::new();
            for hops in live {
                let new_hops = hops - 1;
                block.finished_hops += 1;
                if new_hops == 0 {
                    block.finished_particles += 1;
                } else if neighbors.is_empty() {
                    // End of the chain: keep bouncing the particle in place
                    // until its budget runs out, since there's nowhere
                    // forward to send it.
                    block.live.push(new_hops);
                } else {
                    to_forward.push(new_hops);
                }
            }
            if !to_forward.is_empty() || !block.live.is_empty() {
                if !to_forward.is_empty() {
                    proxy.enqueue_value(neighbors[0], &to_forward).unwrap();
                }
                block.idle_ticks = 0;
            } else {
                block.idle_ticks += 1;
            }
            block.idle_ticks > 5
        })
        .unwrap();

    let assigner = RoundRobinAssigner::new(seeds.len(), 1);
    let partners = Merge::new(RegularPartners::new(vec![seeds.len()], 2, true));
    reduce(
        &mut master,
        &assigner,
        &partners,
        |block, proxy, _partners| {
            let mut acc: Tally = (block.expected_particles, block.finished_particles, block.expected_hops, block.finished_hops);
            for &(from, _) in proxy.incoming() {
                if let Some(v) = proxy.dequeue_value::<Tally>(from).unwrap() {
                    acc.0 += v.0;
                    acc.1 += v.1;
                    acc.2 += v.2;
                    acc.3 += v.3;
                }
            }
            block.expected_particles = acc.0;
            block.finished_particles = acc.1;
            block.expected_hops = acc.2;
            block.finished_hops = acc.3;
            for &(to, _) in proxy.outgoing() {
                proxy.enqueue_value(to, &acc).unwrap();
            }
        },
        |_| false,
    )
    .unwrap();

    let lid = master.lid(0).unwrap();
    let totals = master.release(lid).unwrap();
    (totals.expected_particles, totals.finished_particles, totals.expected_hops, totals.finished_hops)
}

proptest! {
    /// P3 — for any chain of 1-10 blocks with 0-6 particles and 1-8 hops
    /// each, iexchange terminates (the call returning at all is the
    /// property under test) and every particle's full hop budget is
    /// accounted for.
    #[test]
    fn bounce_chain_terminates_with_conserved_budget(
        seeds in prop::collection::vec((0u32..6, 1u32..8), 1..10),
    ) {
        let (expected_particles, finished_particles, expected_hops, finished_hops) = run_bounce_chain(&seeds);
        prop_assert_eq!(expected_particles, finished_particles);
        prop_assert_eq!(expected_hops, finished_hops);
    }
}
