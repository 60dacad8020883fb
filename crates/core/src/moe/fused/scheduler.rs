//! Mapping of launch-grid ids to output tiles.
//!
//! The grid is two dimensional: axis 0 enumerates `(row-tile, column-tile)`
//! pairs of one expert's output, axis 1 selects the expert. Axis 0 ids are
//! mapped in bands of `group_size_m` row-tiles that walk the column tiles
//! together, so one column slice of the expert's weights is reused across
//! the band.

use super::config::TileConfig;

/// One unit of work: a single output tile of one local expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileUnit {
    /// Local expert id (axis 1 of the grid).
    pub expert: usize,
    /// Row-tile index within the expert's segment.
    pub pid_m: usize,
    /// Column-tile index within the output width.
    pub pid_n: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TileScheduler {
    tile: TileConfig,
    n: usize,
    num_pid_m: usize,
    num_pid_n: usize,
}

impl TileScheduler {
    /// `padded_m` bounds the rows of any segment; `n` is the output width.
    pub fn new(tile: TileConfig, padded_m: usize, n: usize) -> Self {
        Self {
            tile,
            n,
            num_pid_m: padded_m.div_ceil(tile.block_m),
            num_pid_n: n.div_ceil(tile.block_n),
        }
    }

    /// Units along grid axis 0 (per expert).
    pub fn num_pids(&self) -> usize {
        self.num_pid_m * self.num_pid_n
    }

    /// Full launch grid for `num_experts` local experts.
    pub fn grid(&self, num_experts: usize) -> (usize, usize) {
        (self.num_pids(), num_experts)
    }

    /// Grouped mapping of an axis-0 id to `(pid_m, pid_n)`.
    pub fn tile_coords(&self, pid: usize) -> (usize, usize) {
        let group = self.tile.group_size_m;
        if group <= 1 {
            return (pid % self.num_pid_m, pid / self.num_pid_m);
        }

        let num_pid_in_group = group * self.num_pid_n;
        let group_id = pid / num_pid_in_group;
        let first_pid_m = group_id * group;
        let group_size_m = (self.num_pid_m - first_pid_m).min(group);
        let local = pid % num_pid_in_group;
        (first_pid_m + local % group_size_m, local / group_size_m)
    }

    /// Whether the tile at `(pid_m, pid_n)` starts inside an `m`-row segment.
    #[inline]
    pub fn in_bounds(&self, m: usize, pid_m: usize, pid_n: usize) -> bool {
        pid_m * self.tile.block_m < m && pid_n * self.tile.block_n < self.n
    }

    /// Tiles that must run for a local expert whose segment has `m` rows,
    /// in grid order. Tiles starting past the segment or the output width
    /// are not launched.
    pub fn units_for_segment(&self, expert: usize, m: usize) -> impl Iterator<Item = TileUnit> + '_ {
        (0..self.num_pids()).filter_map(move |pid| {
            let (pid_m, pid_n) = self.tile_coords(pid);
            self.in_bounds(m, pid_m, pid_n).then_some(TileUnit {
                expert,
                pid_m,
                pid_n,
            })
        })
    }
}
