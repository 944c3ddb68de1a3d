//! Per-block neighborhood.
//!
//! `diy::Link` is a small class hierarchy (`Link`, `RegularLink`,
//! `BoundsLink<Bounds>`, and the diamond `RegularGridLink`/
//! `RegularContinuousLink` that inherit both). That maps naturally onto a
//! tagged variant here: every link carries a plain neighbor list, and
//! `Direction`/`Bounds` annotations are optional extra fields rather than
//! separate base classes, avoiding Rust's lack of multiple inheritance
//! without losing any of the four combinations the core actually needs.

use crate::block::{BlockId, Gid};

/// A bitmask over `2*dim` direction bits, one pair (negative/positive) per
/// dimension — the same encoding `diy::Direction` uses, so `wrap()` can be
/// combined with `|` the way `add_wrap` does in the original.
pub type Direction = i32;

/// The geometric annotations a `Link` may additionally carry per neighbor.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LinkAnnotations<Bounds> {
    pub directions: Vec<Direction>,
    pub wrap: Direction,
    pub core: Option<Bounds>,
    pub bounds: Option<Bounds>,
    pub neighbor_bounds: Vec<Bounds>,
}

/// The ordered neighborhood of one local block.
///
/// `Bounds` is left generic so callers can plug in whatever discrete or
/// continuous bounds type their decomposition uses; the core only ever
/// stores, transports, and compares it structurally (P4/P5).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Link<Bounds = ()> {
    neighbors: Vec<BlockId>,
    dimension: Option<u32>,
    annotations: LinkAnnotations<Bounds>,
}

impl<Bounds> Link<Bounds> {
    pub fn new() -> Self {
        Link {
            neighbors: Vec::new(),
            dimension: None,
            annotations: LinkAnnotations::default(),
        }
    }

    pub fn with_dimension(dim: u32) -> Self {
        let mut link = Self::new();
        link.dimension = Some(dim);
        link
    }

    pub fn add_neighbor(&mut self, block: BlockId) {
        self.neighbors.push(block);
    }

    /// Adds a neighbor together with its direction and bounds annotation.
    /// Panics if called after a plain `add_neighbor` left the annotation
    /// vectors out of sync — annotated and unannotated neighbors must not be
    /// mixed on the same link, mirroring the fact that `RegularLink` and
    /// `BoundsLink` are always constructed together in `RegularGridLink`.
    pub fn add_annotated_neighbor(&mut self, block: BlockId, direction: Direction, bounds: Bounds) {
        self.neighbors.push(block);
        self.annotations.directions.push(direction);
        self.annotations.neighbor_bounds.push(bounds);
    }

    pub fn set_core_bounds(&mut self, core: Bounds, bounds: Bounds) {
        self.annotations.core = Some(core);
        self.annotations.bounds = Some(bounds);
    }

    pub fn add_wrap(&mut self, dir: Direction) {
        self.annotations.wrap |= dir;
    }

    pub fn wrap(&self) -> Direction {
        self.annotations.wrap
    }

    pub fn dimension(&self) -> Option<u32> {
        self.dimension
    }

    pub fn core(&self) -> Option<&Bounds> {
        self.annotations.core.as_ref()
    }

    pub fn bounds(&self) -> Option<&Bounds> {
        self.annotations.bounds.as_ref()
    }

    pub fn neighbor_bounds(&self, i: usize) -> Option<&Bounds> {
        self.annotations.neighbor_bounds.get(i)
    }

    pub fn direction(&self, i: usize) -> Option<Direction> {
        self.annotations.directions.get(i).copied()
    }

    /// Converts a direction bitmask to the index of the neighbor occupying
    /// that direction, or `None` if there is no such neighbor.
    pub fn direction_to_index(&self, dir: Direction) -> Option<usize> {
        self.annotations.directions.iter().position(|&d| d == dir)
    }

    pub fn size(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn target(&self, i: usize) -> BlockId {
        self.neighbors[i]
    }

    pub fn neighbors(&self) -> &[BlockId] {
        &self.neighbors
    }

    pub fn neighbors_mut(&mut self) -> &mut [BlockId] {
        &mut self.neighbors
    }

    pub fn find(&self, gid: Gid) -> Option<usize> {
        self.neighbors.iter().position(|b| b.gid == gid)
    }

    /// The number of *distinct* gids in the link, matching
    /// `Link::count_unique`: a gid may legitimately appear more than once
    /// (e.g. a block that is its own neighbor under periodic wrap with a
    /// single block per dimension), but only counts once toward the number
    /// of senders `exchange` should expect per round.
    pub fn size_unique(&self) -> usize {
        let mut gids: Vec<Gid> = self.neighbors.iter().map(|b| b.gid).collect();
        gids.sort_unstable();
        gids.dedup();
        gids.len()
    }

    /// Rewrites the `proc` field of every neighbor entry pointing at `gid`,
    /// the per-link half of `fix_links` (§4.6 / §10.5).
    pub fn fix_proc(&mut self, gid: Gid, new_proc: crate::block::Proc) {
        for n in self.neighbors.iter_mut() {
            if n.gid == gid {
                n.proc = new_proc;
            }
        }
    }
}

impl<Bounds: PartialEq> PartialEq for Link<Bounds> {
    fn eq(&self, other: &Self) -> bool {
        self.neighbors.len() == other.neighbors.len()
            && self
                .neighbors
                .iter()
                .zip(other.neighbors.iter())
                .all(|(a, b)| a.gid == b.gid && a.proc == b.proc)
            && self.dimension == other.dimension
            && self.annotations.wrap == other.annotations.wrap
            && self.annotations.directions == other.annotations.directions
            && self.annotations.core == other.annotations.core
            && self.annotations.bounds == other.annotations.bounds
            && self.annotations.neighbor_bounds == other.annotations.neighbor_bounds
    }
}
