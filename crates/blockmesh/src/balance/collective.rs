//! Collective load-balance variant: every rank all-gathers `WorkInfo`, then
//! runs the same deterministic LPTF-style scheduler to agree on a move list
//! without any further communication (spec §4.6, Collective variant).

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::assigner::DynamicAssigner;
use crate::error::{Error, Result};
use crate::master::Master;

use super::{apply_moves, local_work_info, MoveInfo, WorkInfo};

pub fn balance_collective<B, Bounds>(
    master: &mut Master<B, Bounds>,
    assigner: &DynamicAssigner,
    work: impl Fn(&B) -> f64,
) -> Result<Vec<MoveInfo>>
where
    Bounds: Serialize + DeserializeOwned + Clone,
{
    let info = local_work_info(master, &work)?;
    let payload = bincode::serialize(&info).map_err(|e| Error::Serialization(e.to_string()))?;
    let gathered = master.comm().all_gather_bytes(payload);
    let mut infos = Vec::with_capacity(gathered.len());
    for bytes in gathered {
        infos.push(bincode::deserialize::<WorkInfo>(&bytes).map_err(|e| Error::Deserialization(e.to_string()))?);
    }

    let moves = decide_moves(&infos);
    apply_moves(master, assigner, &moves)?;
    Ok(moves)
}

/// A deterministic greedy pass: repeatedly move the single heaviest known
/// block on the heaviest rank (by `top_work`) to the currently lightest
/// rank (by `proc_work`), as long as doing so narrows the gap between them
/// by more than the moved block's own work, the source has a block to
/// spare, and the two ranks differ. Once a rank's sampled block has been
/// moved away we have no visibility into its next-heaviest block without a
/// fresh `WorkInfo` round, so its `top_work` is zeroed and it drops out of
/// consideration as a source for the rest of this pass.
fn decide_moves(work_infos: &[WorkInfo]) -> Vec<MoveInfo> {
    let mut state: Vec<WorkInfo> = work_infos.to_vec();
    let mut moves = Vec::new();
    loop {
        let heavy = state
            .iter()
            .enumerate()
            .filter(|(_, w)| w.nlocal_blocks > 1 && w.top_work > 0.0)
            .max_by(|a, b| a.1.top_work.partial_cmp(&b.1.top_work).unwrap());
        let Some((heavy_idx, heavy)) = heavy.map(|(i, w)| (i, *w)) else { break };
        let light = state
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != heavy_idx)
            .min_by(|a, b| a.1.proc_work.partial_cmp(&b.1.proc_work).unwrap());
        let Some((light_idx, light)) = light.map(|(i, w)| (i, *w)) else { break };

        let before_gap = heavy.proc_work - light.proc_work;
        let after_gap = ((heavy.proc_work - heavy.top_work) - (light.proc_work + heavy.top_work)).abs();
        let improvement = before_gap - after_gap;
        if improvement <= heavy.top_work {
            break;
        }

        moves.push(MoveInfo { gid: heavy.top_gid, from: heavy.rank, to: light.rank });
        state[heavy_idx].proc_work -= heavy.top_work;
        state[heavy_idx].nlocal_blocks -= 1;
        state[heavy_idx].top_work = 0.0;
        state[light_idx].proc_work += heavy.top_work;
        state[light_idx].nlocal_blocks += 1;
    }
    moves
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_moves_balances_a_single_overloaded_rank() {
        let infos = vec![
            WorkInfo { rank: 0, top_gid: 1, top_work: 10.0, proc_work: 10.0, nlocal_blocks: 2 },
            WorkInfo { rank: 1, top_gid: 2, top_work: 1.0, proc_work: 1.0, nlocal_blocks: 1 },
        ];
        let moves = decide_moves(&infos);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0], MoveInfo { gid: 1, from: 0, to: 1 });
    }

    #[test]
    fn decide_moves_is_noop_when_balanced() {
        let infos = vec![
            WorkInfo { rank: 0, top_gid: 1, top_work: 1.0, proc_work: 5.0, nlocal_blocks: 2 },
            WorkInfo { rank: 1, top_gid: 2, top_work: 1.0, proc_work: 5.0, nlocal_blocks: 2 },
        ];
        assert!(decide_moves(&infos).is_empty());
    }

    #[test]
    fn decide_moves_never_drains_the_lone_block_on_a_rank() {
        let infos = vec![
            WorkInfo { rank: 0, top_gid: 1, top_work: 10.0, proc_work: 10.0, nlocal_blocks: 1 },
            WorkInfo { rank: 1, top_gid: 2, top_work: 0.0, proc_work: 0.0, nlocal_blocks: 0 },
        ];
        assert!(decide_moves(&infos).is_empty());
    }
}
