//! Partner schedules: which gids a block exchanges with in each round of a
//! reduction. Grounded on `diy::RegularDecomposer`'s `RegularPartners` and
//! the `partners/{merge,swap,all-reduce}.hpp` derived schedules.

use crate::block::Gid;

/// The capability the reduction driver needs from a partner schedule.
/// Concrete variants (merge, swap, broadcast, all-reduce) each implement it.
pub trait Partners: Send + Sync {
    fn rounds(&self) -> usize;
    fn size(&self, round: usize) -> usize;
    fn dim(&self, round: usize) -> usize;
    fn active(&self, round: usize, gid: Gid, nblocks: usize) -> bool;
    fn incoming(&self, round: usize, gid: Gid, nblocks: usize, out: &mut Vec<Gid>);
    fn outgoing(&self, round: usize, gid: Gid, nblocks: usize, out: &mut Vec<Gid>);
}

/// A dimension-wise factoring of `nblocks` into rounds, each round either
/// `contiguous` (geometrically adjacent groups) or strided (sampled
/// groups), shared by merge/swap/broadcast/all-reduce.
#[derive(Debug, Clone)]
pub struct RegularPartners {
    /// Per-dimension block counts, e.g. `[4, 4]` for a 4x4 grid.
    divisions: Vec<usize>,
    /// Per-round `(dimension, group_size)`.
    schedule: Vec<(usize, usize)>,
    contiguous: bool,
}

impl RegularPartners {
    /// Factors `k` into a sequence of round sizes for one dimension: the
    /// largest factor `<= k` that divides the remaining size, repeated;
    /// if no such factor exists, the remainder itself becomes the final
    /// round.
    fn factor(mut remaining: usize, k: usize) -> Vec<usize> {
        let mut rounds = Vec::new();
        while remaining > 1 {
            let factor = (2..=k.min(remaining)).rev().find(|f| remaining % f == 0);
            match factor {
                Some(f) => {
                    rounds.push(f);
                    remaining /= f;
                }
                None => {
                    rounds.push(remaining);
                    remaining = 1;
                }
            }
        }
        rounds
    }

    pub fn new(divisions: Vec<usize>, k: usize, contiguous: bool) -> Self {
        let mut schedule = Vec::new();
        for (dim, &count) in divisions.iter().enumerate() {
            for size in Self::factor(count, k) {
                schedule.push((dim, size));
            }
        }
        RegularPartners { divisions, schedule, contiguous }
    }

    pub fn rounds(&self) -> usize {
        self.schedule.len()
    }

    fn coords(&self, gid: Gid) -> Vec<usize> {
        let mut remaining = gid as usize;
        let mut coords = vec![0usize; self.divisions.len()];
        for (dim, &count) in self.divisions.iter().enumerate() {
            coords[dim] = remaining % count;
            remaining /= count;
        }
        coords
    }

    fn from_coords(&self, coords: &[usize]) -> Gid {
        let mut gid = 0usize;
        let mut stride = 1usize;
        for (dim, &count) in self.divisions.iter().enumerate() {
            gid += coords[dim] * stride;
            stride *= count;
        }
        gid as Gid
    }

    /// Step size for round `round`'s dimension, given how many prior rounds
    /// in the same dimension have already run.
    fn step(&self, round: usize) -> usize {
        let (dim, _) = self.schedule[round];
        let prior_in_dim: usize = self.schedule[..round].iter().filter(|&&(d, _)| d == dim).map(|&(_, s)| s).product();
        if self.contiguous {
            prior_in_dim.max(1)
        } else {
            (self.divisions[dim] / prior_in_dim.max(1)).max(1)
        }
    }

    pub fn group_position(&self, round: usize, coord: usize, step: usize) -> usize {
        let (_, size) = self.schedule[round];
        (coord / step) % size
    }

    /// Every gid sharing `gid`'s group in round `round`.
    pub fn fill(&self, round: usize, gid: Gid, out: &mut Vec<Gid>) {
        out.clear();
        let (dim, size) = self.schedule[round];
        let step = self.step(round);
        let coords = self.coords(gid);
        let position = self.group_position(round, coords[dim], step);
        let base = coords[dim] - (coords[dim] / step % size) * step;
        for i in 0..size {
            let mut member = coords.clone();
            member[dim] = base + i * step;
            if member[dim] >= self.divisions[dim] {
                continue;
            }
            out.push(self.from_coords(&member));
        }
        let _ = position;
    }

    fn is_group_min(&self, round: usize, gid: Gid) -> bool {
        let mut members = Vec::new();
        self.fill(round, gid, &mut members);
        members.iter().all(|&m| m >= gid)
    }

    /// Whether `gid` is the minimum of its group in every round of the same
    /// dimension up to and including `round`.
    fn is_merge_active(&self, round: usize, gid: Gid) -> bool {
        (0..=round).filter(|&r| self.schedule[r].0 == self.schedule[round].0).all(|r| self.is_group_min(r, gid))
    }
}

/// Gid 0 alone survives to the final round; each round folds a group into
/// its minimum-numbered member.
pub struct Merge {
    partners: RegularPartners,
}

impl Merge {
    pub fn new(partners: RegularPartners) -> Self {
        Merge { partners }
    }
}

impl Partners for Merge {
    fn rounds(&self) -> usize {
        self.partners.rounds()
    }

    fn size(&self, round: usize) -> usize {
        self.partners.schedule[round].1
    }

    fn dim(&self, round: usize) -> usize {
        self.partners.schedule[round].0
    }

    fn active(&self, round: usize, gid: Gid, _nblocks: usize) -> bool {
        round == 0 || self.partners.is_merge_active(round - 1, gid)
    }

    fn incoming(&self, round: usize, gid: Gid, _nblocks: usize, out: &mut Vec<Gid>) {
        if round == 0 {
            out.clear();
            return;
        }
        self.partners.fill(round - 1, gid, out);
        out.retain(|&g| g != gid);
    }

    fn outgoing(&self, round: usize, gid: Gid, _nblocks: usize, out: &mut Vec<Gid>) {
        if round == self.rounds() {
            out.clear();
            return;
        }
        self.partners.fill(round, gid, out);
        if let Some(&min) = out.iter().min() {
            out.clear();
            if min != gid {
                out.push(min);
            }
        }
    }
}

/// Every block active every round, exchanging a full group's worth of
/// pieces each time — the basis for sample-sort style all-to-all shuffles.
pub struct Swap {
    partners: RegularPartners,
}

impl Swap {
    pub fn new(partners: RegularPartners) -> Self {
        Swap { partners }
    }
}

impl Partners for Swap {
    fn rounds(&self) -> usize {
        self.partners.rounds()
    }

    fn size(&self, round: usize) -> usize {
        self.partners.schedule[round].1
    }

    fn dim(&self, round: usize) -> usize {
        self.partners.schedule[round].0
    }

    fn active(&self, _round: usize, _gid: Gid, _nblocks: usize) -> bool {
        true
    }

    fn incoming(&self, round: usize, gid: Gid, _nblocks: usize, out: &mut Vec<Gid>) {
        if round == 0 {
            out.clear();
        } else {
            self.partners.fill(round - 1, gid, out);
        }
    }

    fn outgoing(&self, round: usize, gid: Gid, _nblocks: usize, out: &mut Vec<Gid>) {
        if round == self.rounds() {
            out.clear();
        } else {
            self.partners.fill(round, gid, out);
        }
    }
}

/// Mirror image of `Merge`: rounds run in reverse, in/out swapped, so a
/// value collapsed to gid 0 by a merge fans back out to every block.
pub struct Broadcast {
    merge: Merge,
}

impl Broadcast {
    pub fn new(partners: RegularPartners) -> Self {
        Broadcast { merge: Merge::new(partners) }
    }

    fn mirror(&self, round: usize) -> usize {
        self.rounds() - round
    }
}

impl Partners for Broadcast {
    fn rounds(&self) -> usize {
        self.merge.rounds()
    }

    fn size(&self, round: usize) -> usize {
        self.merge.size(self.mirror(round).saturating_sub(1).min(self.merge.rounds() - 1))
    }

    fn dim(&self, round: usize) -> usize {
        self.merge.dim(self.mirror(round).saturating_sub(1).min(self.merge.rounds() - 1))
    }

    fn active(&self, round: usize, gid: Gid, nblocks: usize) -> bool {
        self.merge.active(self.mirror(round), gid, nblocks)
    }

    fn incoming(&self, round: usize, gid: Gid, nblocks: usize, out: &mut Vec<Gid>) {
        self.merge.outgoing(self.mirror(round), gid, nblocks, out);
    }

    fn outgoing(&self, round: usize, gid: Gid, nblocks: usize, out: &mut Vec<Gid>) {
        self.merge.incoming(self.mirror(round), gid, nblocks, out);
    }
}

/// Two merge passes back to back: the first collapses to gid 0, the second
/// (rounds mirrored, in/out swapped) fans the combined value back out so
/// every block ends up holding the same reduced value.
pub struct AllReduce {
    merge: Merge,
}

impl AllReduce {
    pub fn new(partners: RegularPartners) -> Self {
        AllReduce { merge: Merge::new(partners) }
    }

    fn half(&self) -> usize {
        self.merge.rounds()
    }
}

impl Partners for AllReduce {
    fn rounds(&self) -> usize {
        2 * self.half()
    }

    fn size(&self, round: usize) -> usize {
        if round < self.half() {
            self.merge.size(round)
        } else {
            self.merge.size(2 * self.half() - 1 - round)
        }
    }

    fn dim(&self, round: usize) -> usize {
        if round < self.half() {
            self.merge.dim(round)
        } else {
            self.merge.dim(2 * self.half() - 1 - round)
        }
    }

    fn active(&self, round: usize, gid: Gid, nblocks: usize) -> bool {
        if round < self.half() {
            self.merge.active(round, gid, nblocks)
        } else {
            self.merge.active(2 * self.half() - round, gid, nblocks)
        }
    }

    fn incoming(&self, round: usize, gid: Gid, nblocks: usize, out: &mut Vec<Gid>) {
        if round < self.half() {
            self.merge.incoming(round, gid, nblocks, out);
        } else {
            self.merge.outgoing(2 * self.half() - 1 - round, gid, nblocks, out);
        }
    }

    fn outgoing(&self, round: usize, gid: Gid, nblocks: usize, out: &mut Vec<Gid>) {
        if round < self.half() {
            self.merge.outgoing(round, gid, nblocks, out);
        } else {
            self.merge.incoming(2 * self.half() - round, gid, nblocks, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_picks_largest_divisor_at_most_k() {
        assert_eq!(RegularPartners::factor(8, 2), vec![2, 2, 2]);
        assert_eq!(RegularPartners::factor(6, 4), vec![3, 2]);
        assert_eq!(RegularPartners::factor(5, 2), vec![5]);
    }

    #[test]
    fn merge_eight_blocks_k2_ends_at_gid_zero() {
        let partners = RegularPartners::new(vec![8], 2, true);
        let merge = Merge::new(partners);
        assert_eq!(merge.rounds(), 3);
        for round in 0..merge.rounds() {
            let active: Vec<Gid> = (0..8).filter(|&g| merge.active(round, g, 8)).collect();
            assert!(active.contains(&0));
        }
        assert!(merge.active(merge.rounds() - 1, 0, 8));
    }

    #[test]
    fn swap_all_active_every_round() {
        let partners = RegularPartners::new(vec![8], 2, true);
        let swap = Swap::new(partners);
        for round in 0..swap.rounds() {
            for g in 0..8 {
                assert!(swap.active(round, g, 8));
            }
        }
    }
}
