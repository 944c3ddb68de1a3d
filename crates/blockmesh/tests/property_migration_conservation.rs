//! P6 — migration conservation: after a load-balance wave moves blocks
//! between ranks, every block's payload is untouched, every gid still
//! exists exactly once across all ranks, and every surviving link's
//! neighbor `proc` fields match the new ownership (only `proc` may change).

use std::sync::Arc;

use blockmesh::{apply_moves, BlockId, BlockOps, Communicator, ContiguousAssigner, DynamicAssigner, Link, LocalCommunicator, Master, MasterConfig, MemoryStorage, MoveInfo};

fn ops() -> BlockOps<i64> {
    BlockOps::new(|| 0, |b, buf| buf.extend(b.to_le_bytes()), |b, bytes| *b = i64::from_le_bytes(bytes.try_into().unwrap()))
}

fn chain_link(gid: i64, nblocks: i64, static_assigner: &ContiguousAssigner) -> Link<()> {
    use blockmesh::Assigner;
    let mut link = Link::new();
    if gid > 0 {
        link.add_neighbor(BlockId { gid: gid - 1, proc: static_assigner.rank(gid - 1) });
    }
    if gid + 1 < nblocks {
        link.add_neighbor(BlockId { gid: gid + 1, proc: static_assigner.rank(gid + 1) });
    }
    link
}

#[test]
fn payloads_and_link_structure_survive_a_balance_wave() {
    use blockmesh::Assigner;

    const NBLOCKS: i64 = 4;
    const NRANKS: i32 = 2;
    // Swap gid 1 (rank 0 -> rank 1) with gid 2 (rank 1 -> rank 0).
    let moves = vec![MoveInfo { gid: 1, from: 0, to: 1 }, MoveInfo { gid: 2, from: 1, to: 0 }];

    let comms = LocalCommunicator::new_group(NRANKS);

    let results: Vec<Vec<(i64, i64, Vec<i64>)>> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for rank in 0..NRANKS {
            let comm: Arc<dyn Communicator> = comms[rank as usize].clone();
            let moves = moves.clone();
            let static_assigner = ContiguousAssigner::new(NBLOCKS as usize, NRANKS);
            handles.push(scope.spawn(move || {
                let storage = Arc::new(MemoryStorage::new());
                let mut master: Master<i64, ()> = Master::new(comm, storage, ops(), MasterConfig { in_memory_limit: 0, threads: 1, ..Default::default() });
                let dyn_assigner = DynamicAssigner::from_static(&static_assigner, NRANKS);

                for gid in static_assigner.local_gids(rank) {
                    let payload = gid * 10;
                    let link = chain_link(gid, NBLOCKS, &static_assigner);
                    master.add(gid, payload, link);
                }

                apply_moves(&mut master, &dyn_assigner, &moves).unwrap();

                let mut out = Vec::new();
                for gid in dyn_assigner.local_gids(rank) {
                    let lid = master.lid(gid).unwrap();
                    let neighbor_procs: Vec<(i64, i32)> =
                        master.link(lid).unwrap().neighbors().iter().map(|n| (n.gid, n.proc)).collect();
                    for (nbr_gid, proc) in &neighbor_procs {
                        assert_eq!(*proc, dyn_assigner.rank(*nbr_gid), "neighbor {nbr_gid}'s recorded proc is stale after migration");
                    }
                    let neighbor_gids: Vec<i64> = neighbor_procs.into_iter().map(|(g, _)| g).collect();
                    let payload = master.release(lid).unwrap();
                    out.push((gid, payload, neighbor_gids));
                }
                out
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all: Vec<(i64, i64, Vec<i64>)> = results.into_iter().flatten().collect();
    all.sort_by_key(|(gid, _, _)| *gid);

    assert_eq!(all.len(), NBLOCKS as usize, "every gid must still exist exactly once after the wave");
    for (gid, payload, mut neighbors) in all {
        neighbors.sort();
        assert_eq!(payload, gid * 10, "block {gid}'s payload changed across migration");
        let mut expected_neighbors: Vec<i64> = Vec::new();
        if gid > 0 {
            expected_neighbors.push(gid - 1);
        }
        if gid + 1 < NBLOCKS {
            expected_neighbors.push(gid + 1);
        }
        expected_neighbors.sort();
        assert_eq!(neighbors, expected_neighbors, "block {gid}'s link topology changed across migration");
    }
}
