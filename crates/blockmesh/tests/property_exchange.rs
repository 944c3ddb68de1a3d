//! P1/P2 — conservation and FIFO ordering across `exchange`. A single-rank
//! chain topology lets every enqueue/dequeue pair be checked without the
//! added noise of real cross-rank delivery (covered separately by S1).

use std::sync::Arc;

use blockmesh::{never_skip, BlockId, BlockOps, Communicator, Link, LocalCommunicator, Master, MasterConfig, MemoryStorage};
use proptest::prelude::*;

#[derive(Default, Clone)]
struct ChainBlock {
    received: Vec<i64>,
}

fn ops() -> BlockOps<ChainBlock> {
    BlockOps::new(ChainBlock::default, |_, _| {}, |_, _| {})
}

/// Runs `rounds` of "enqueue this round number to the next block in the
/// chain" over `nblocks` blocks linked `0 -> 1 -> ... -> n-1` (no wrap), and
/// returns each block's received sequence from its single upstream neighbor.
fn run_chain(nblocks: i64, rounds: u32) -> Vec<Vec<i64>> {
    let comm: Arc<dyn Communicator> = LocalCommunicator::new_group(1).remove(0);
    let storage = Arc::new(MemoryStorage::new());
    let mut master: Master<ChainBlock, ()> = Master::new(comm, storage, ops(), MasterConfig { in_memory_limit: 0, threads: 1, ..Default::default() });
    let mut lids = Vec::new();
    for gid in 0..nblocks {
        let mut link = Link::new();
        if gid + 1 < nblocks {
            link.add_neighbor(BlockId { gid: gid + 1, proc: 0 });
        }
        lids.push(master.add(gid, ChainBlock::default(), link));
    }

    for round in 0..rounds {
        master
            .foreach(
                move |block: &mut ChainBlock, proxy| {
                    if proxy.gid() > 0 {
                        if let Ok(Some(v)) = proxy.dequeue_value::<i64>(proxy.gid() - 1) {
                            block.received.push(v);
                        }
                    }
                    let neighbors: Vec<i64> = proxy.link().neighbors().iter().map(|n| n.gid).collect();
                    for nbr in neighbors {
                        proxy.enqueue_value(nbr, &(round as i64)).unwrap();
                    }
                },
                never_skip(),
            )
            .unwrap();
        master.exchange(false).unwrap();
    }
    // Drain the final round's delivery without sending anything further.
    master
        .foreach(
            |block: &mut ChainBlock, proxy| {
                if proxy.gid() > 0 {
                    if let Ok(Some(v)) = proxy.dequeue_value::<i64>(proxy.gid() - 1) {
                        block.received.push(v);
                    }
                }
            },
            never_skip(),
        )
        .unwrap();
    master.execute().unwrap();

    lids.into_iter().map(|lid| master.release(lid).unwrap().received).collect()
}

proptest! {
    /// P1 — conservation: every block but the first receives exactly
    /// `rounds` records from its single upstream neighbor (none dropped,
    /// none duplicated).
    #[test]
    fn conservation_every_enqueue_is_eventually_dequeued(
        nblocks in 2i64..8,
        rounds in 1u32..6,
    ) {
        let received = run_chain(nblocks, rounds);
        for (gid, seq) in received.iter().enumerate() {
            if gid == 0 {
                prop_assert!(seq.is_empty());
            } else {
                prop_assert_eq!(seq.len(), rounds as usize);
            }
        }
    }

    /// P2 — FIFO per pair: each block's received sequence is exactly
    /// `0, 1, ..., rounds-1` in order, matching the order its single
    /// upstream neighbor enqueued them.
    #[test]
    fn fifo_order_is_preserved_per_pair(
        nblocks in 2i64..8,
        rounds in 1u32..6,
    ) {
        let received = run_chain(nblocks, rounds);
        let expected: Vec<i64> = (0..rounds as i64).collect();
        for seq in received.iter().skip(1) {
            prop_assert_eq!(seq, &expected);
        }
    }
}
