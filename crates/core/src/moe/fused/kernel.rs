//! The fused projection kernel.
//!
//! One invocation computes one output tile of one expert: a masked, blocked
//! matrix multiply of up to `block_m` gathered rows of `A` against a
//! `block_n`-wide slice of the expert's weights, with an `f32` accumulator.
//!
//! Row addressing is driven by [`ProjectionPass`]:
//!
//! | pass      | `A` row            | `C` row            | gating |
//! |-----------|--------------------|--------------------|--------|
//! | gate/up   | `sorted_idx / top_k` | sorted position  | no     |
//! | down      | sorted position    | `sorted_idx`       | yes    |

use super::config::TileConfig;
use super::operand::{ExpertWeights, KernelElement, MatrixView};
use super::scheduler::TileUnit;
use super::segments::ExpertSegments;

/// Row-addressing and epilogue strategy of one projection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionPass {
    /// Gather `A` rows through `sorted_idx / top_k` (token rows shared by
    /// several top-k slots) instead of reading them in sorted order.
    pub reindex_a: bool,
    /// Scatter `C` rows to `sorted_idx` (original flat slot) instead of
    /// writing them in sorted order.
    pub reindex_c: bool,
    /// Scale each output row by the slot's gating weight before the store.
    pub apply_weights: bool,
    pub top_k: usize,
}

impl ProjectionPass {
    /// First pass: token rows in, segment-ordered rows out, no gating.
    pub fn gate_up(top_k: usize) -> Self {
        Self {
            reindex_a: true,
            reindex_c: false,
            apply_weights: false,
            top_k,
        }
    }

    /// Second pass: segment-ordered rows in, per-slot rows out, gated.
    pub fn down() -> Self {
        Self {
            reindex_a: false,
            reindex_c: true,
            apply_weights: true,
            top_k: 1,
        }
    }
}

/// Everything a unit reads. Shared read-only across all units of a launch.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionOperands<'a, T> {
    pub a: MatrixView<'a, T>,
    /// `(E_local, N, K)` weights; the grid's expert axis indexes these.
    pub b: ExpertWeights<'a, T>,
    pub sorted_idx: &'a [usize],
    /// Segment table over the global expert id space.
    pub segments: &'a ExpertSegments,
    /// Per flat slot gating weights, read when the pass applies them.
    pub weights: Option<&'a [f32]>,
    /// Global id of local expert 0.
    pub expert_offset: usize,
}

/// A finished tile: `rows.len() x num_cols` values, row-major, destined for
/// columns `[col_start, col_start + num_cols)` of the listed rows.
#[derive(Debug, Clone, PartialEq)]
pub struct TileOutput<T> {
    pub rows: Vec<usize>,
    pub col_start: usize,
    pub num_cols: usize,
    pub values: Vec<T>,
}

/// Execute one unit. Returns `None` when the unit has nothing to do: empty
/// segment, or a tile starting past the segment or the output width.
///
/// Operands must already have passed `launch_projection`'s shape checks.
pub(crate) fn compute_tile<T: KernelElement>(
    ops: &ProjectionOperands<'_, T>,
    pass: ProjectionPass,
    tile: &TileConfig,
    unit: TileUnit,
) -> Option<TileOutput<T>> {
    let (exp_start, exp_end) = ops.segments.bounds(unit.expert + ops.expert_offset);
    if exp_end <= exp_start {
        return None;
    }
    let m = exp_end - exp_start;
    let n = ops.b.n();
    let k_dim = ops.b.k();
    let (bm, bn, bk) = (tile.block_m, tile.block_n, tile.block_k);
    if unit.pid_m * bm >= m || unit.pid_n * bn >= n {
        return None;
    }

    // Row gather. Lanes past the segment end are masked: never loaded,
    // never accumulated, never stored.
    let row_start = exp_start + unit.pid_m * bm;
    let live_rows = bm.min(exp_end - row_start);
    let positions = row_start..row_start + live_rows;
    let sids: Vec<usize> = ops.sorted_idx[positions.clone()].to_vec();
    let a_rows: Vec<usize> = if pass.reindex_a {
        sids.iter().map(|&sid| sid / pass.top_k).collect()
    } else {
        positions.clone().collect()
    };

    // Column slice with modular wraparound; wrapped lanes are recomputed
    // but only the first `num_cols` are stored.
    let col_start = unit.pid_n * bn;
    let num_cols = bn.min(n - col_start);
    let b_cols: Vec<usize> = (0..bn).map(|j| (col_start + j) % n).collect();
    let b_base = ops.b.expert_base(unit.expert);

    let mut acc = vec![0f32; live_rows * bn];
    let mut a_tile = vec![0f32; live_rows * bk];
    let mut b_tile = vec![0f32; bk * bn];

    for k0 in (0..k_dim).step_by(bk) {
        let kw = bk.min(k_dim - k0);

        for (r, &a_row) in a_rows.iter().enumerate() {
            for kk in 0..kw {
                a_tile[r * bk + kk] = ops.a.get(a_row, k0 + kk).to_acc();
            }
        }
        for kk in 0..kw {
            for (j, &col) in b_cols.iter().enumerate() {
                b_tile[kk * bn + j] = ops.b.get(b_base, col, k0 + kk).to_acc();
            }
        }

        for r in 0..live_rows {
            let acc_row = &mut acc[r * bn..(r + 1) * bn];
            for kk in 0..kw {
                let a = a_tile[r * bk + kk];
                let b_row = &b_tile[kk * bn..(kk + 1) * bn];
                for (c, &b) in acc_row.iter_mut().zip(b_row) {
                    *c += a * b;
                }
            }
        }
    }

    if pass.apply_weights {
        debug_assert!(ops.weights.is_some(), "gated pass launched without weights");
        if let Some(weights) = ops.weights {
            for (r, &sid) in sids.iter().enumerate() {
                let w = weights[sid];
                acc[r * bn..(r + 1) * bn].iter_mut().for_each(|c| *c *= w);
            }
        }
    }

    let rows = if pass.reindex_c {
        sids
    } else {
        positions.collect()
    };
    let mut values = Vec::with_capacity(live_rows * num_cols);
    for r in 0..live_rows {
        values.extend(acc[r * bn..r * bn + num_cols].iter().map(|&c| T::from_acc(c)));
    }

    Some(TileOutput {
        rows,
        col_start,
        num_cols,
        values,
    })
}
