//! S4 — iexchange particle bounce: blocks relay particles that carry a hop
//! budget, decrementing it on every hop until it reaches zero. A subsequent
//! merge-reduce over `(expected_particles, finished_particles, expected_hops,
//! finished_hops)` must show the two pairs equal (P3: termination with work
//! counters at zero, plus conservation of the particle/hop budget).

use std::sync::Arc;

use blockmesh::{reduce, BlockId, BlockOps, Communicator, HoldPolicy, Link, LocalCommunicator, Master, MasterConfig, MemoryStorage, Merge, RegularPartners, RoundRobinAssigner, Variant};

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

#[test]
fn particle_hop_budget_is_conserved() {
    let comm: Arc<dyn Communicator> = LocalCommunicator::new_group(1).remove(0);
    let storage = Arc::new(MemoryStorage::new());
    let mut master: Master<BounceBlock, ()> = Master::new(comm, storage, ops(), MasterConfig { in_memory_limit: 0, threads: 1, ..Default::default() });

    let mut link0 = Link::new();
    link0.add_neighbor(BlockId { gid: 1, proc: 0 });
    let mut link1 = Link::new();
    link1.add_neighbor(BlockId { gid: 0, proc: 0 });

    // Block 0 starts with 2 particles at 2 hops each; block 1 starts with
    // its own single particle at 1 hop, finishing on its very first tick.
    master.add(
        0,
        BounceBlock { live: vec![2, 2], expected_particles: 2, expected_hops: 4, ..Default::default() },
        link0,
    );
    master.add(
        1,
        BounceBlock { live: vec![1], expected_particles: 1, expected_hops: 1, ..Default::default() },
        link1,
    );

    master
        .iexchange(Variant::CollectiveBarrier, HoldPolicy::default(), |block, proxy| {
            let neighbors: Vec<i64> = proxy.link().neighbors().iter().map(|n| n.gid).collect();
            for nbr in neighbors {
                if let Ok(Some(incoming)) = proxy.dequeue_value::<Vec<u32>>(nbr) {
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
                } else {
                    to_forward.push(new_hops);
                }
            }
            if !to_forward.is_empty() {
                let neighbor = proxy.link().neighbors()[0].gid;
                proxy.enqueue_value(neighbor, &to_forward).unwrap();
                block.idle_ticks = 0;
            } else {
                block.idle_ticks += 1;
            }
            // A block only declares itself done after several consecutive
            // idle ticks, giving an in-flight forward from its neighbor time
            // to land before this block stops being polled.
            block.idle_ticks > 5
        })
        .unwrap();

    let assigner = RoundRobinAssigner::new(2, 1);
    let partners = Merge::new(RegularPartners::new(vec![2], 2, true));
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
    assert_eq!(totals.expected_particles, totals.finished_particles);
    assert_eq!(totals.expected_hops, totals.finished_hops);
}
