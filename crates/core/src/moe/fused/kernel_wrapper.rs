//! Launching a projection pass over the full `(tiles, experts)` grid.
//!
//! Units run in parallel on the rayon pool with no synchronization between
//! them. Write-disjointness follows from the dispatch permutation being a
//! bijection: every destination row belongs to exactly one segment, and
//! every column to exactly one column tile. Units run in waves of a few per
//! pool thread; a wave's tiles are stored before the next wave starts.

use rayon::prelude::*;

use super::buffer::IntermediateBuffer;
use super::config::TileConfig;
use super::kernel::{compute_tile, ProjectionOperands, ProjectionPass, TileOutput};
use super::operand::KernelElement;
use super::scheduler::{TileScheduler, TileUnit};
use crate::error::{MoeError, Result};

/// Counters for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchStats {
    /// Grid size (`tiles per expert * local experts`).
    pub grid_units: usize,
    /// Units that produced a tile.
    pub units_executed: usize,
    /// Destination elements stored.
    pub elements_written: usize,
}

/// Check operand shapes against each other and against the destination.
fn validate<T: KernelElement>(
    ops: &ProjectionOperands<'_, T>,
    pass: ProjectionPass,
    out_rows: usize,
    out_width: usize,
) -> Result<()> {
    if pass.top_k == 0 {
        return Err(MoeError::config("top_k must be positive"));
    }
    if ops.a.cols() != ops.b.k() {
        return Err(MoeError::shape(
            "projection contraction dim",
            &[ops.b.k()],
            &[ops.a.cols()],
        ));
    }
    if out_width != ops.b.n() {
        return Err(MoeError::shape("projection output width", &[ops.b.n()], &[out_width]));
    }
    let local = ops.b.num_experts();
    if ops.expert_offset + local > ops.segments.num_experts() {
        return Err(MoeError::config(format!(
            "experts [{}, {}) exceed the {} experts of the dispatch plan",
            ops.expert_offset,
            ops.expert_offset + local,
            ops.segments.num_experts()
        )));
    }
    if pass.apply_weights && ops.weights.map_or(true, |w| w.len() < ops.sorted_idx.len()) {
        return Err(MoeError::config("gated pass needs one weight per token-slot"));
    }

    // Rows addressed by gathers and scatters must exist.
    let slots = ops.sorted_idx.len();
    let a_rows_needed = if pass.reindex_a {
        slots.div_ceil(pass.top_k)
    } else {
        slots
    };
    if ops.a.rows() < a_rows_needed {
        return Err(MoeError::shape("projection input rows", &[a_rows_needed], &[ops.a.rows()]));
    }
    if out_rows < slots {
        return Err(MoeError::shape("projection output rows", &[slots], &[out_rows]));
    }
    Ok(())
}

/// Units that must run: empty segments are skipped before any tile is
/// enumerated.
fn grid_units<F>(scheduler: &TileScheduler, segment_len: F, local: usize) -> Vec<TileUnit>
where
    F: Fn(usize) -> usize,
{
    (0..local)
        .filter(|&expert| segment_len(expert) > 0)
        .flat_map(|expert| scheduler.units_for_segment(expert, segment_len(expert)))
        .collect()
}

/// Units computed per pool thread before their tiles are stored.
const UNITS_PER_THREAD: usize = 4;

fn wave_len() -> usize {
    rayon::current_num_threads().max(1) * UNITS_PER_THREAD
}

/// Run every unit of the grid, `wave_len` units at a time. Each wave is
/// computed in parallel and handed to `sink` in grid order, so at most one
/// wave of tiles is staged at once.
fn run_waves<T, F>(
    ops: &ProjectionOperands<'_, T>,
    pass: ProjectionPass,
    tile: &TileConfig,
    padded_m: usize,
    wave_len: usize,
    mut sink: F,
) where
    T: KernelElement,
    F: FnMut(Vec<TileOutput<T>>),
{
    let scheduler = TileScheduler::new(*tile, padded_m, ops.b.n());
    let units = grid_units(
        &scheduler,
        |expert| ops.segments.len(expert + ops.expert_offset),
        ops.b.num_experts(),
    );

    for wave in units.chunks(wave_len.max(1)) {
        let tiles: Vec<TileOutput<T>> = wave
            .par_iter()
            .filter_map(|&unit| compute_tile(ops, pass, tile, unit))
            .collect();
        sink(tiles);
    }
}

/// Compute the whole grid and discard the tiles. Benchmark body for the
/// autotuner; operands must already be valid for `launch_projection`.
pub(crate) fn bench_projection<T: KernelElement>(
    ops: &ProjectionOperands<'_, T>,
    pass: ProjectionPass,
    tile: &TileConfig,
    padded_m: usize,
) {
    run_waves(ops, pass, tile, padded_m, wave_len(), |tiles| {
        std::hint::black_box(tiles);
    });
}

/// Launch one projection pass into `out`.
pub fn launch_projection<T: KernelElement>(
    ops: &ProjectionOperands<'_, T>,
    pass: ProjectionPass,
    out: &mut IntermediateBuffer<T>,
    tile: &TileConfig,
    padded_m: usize,
) -> Result<LaunchStats> {
    if !tile.is_valid() {
        return Err(MoeError::config(format!("tile config has a zero dimension: {tile:?}")));
    }
    validate(ops, pass, out.rows(), out.width())?;

    let mut units_executed = 0;
    let mut elements_written = 0;
    run_waves(ops, pass, tile, padded_m, wave_len(), |tiles| {
        for t in &tiles {
            out.store_tile(t);
            elements_written += t.rows.len() * t.num_cols;
        }
        units_executed += tiles.len();
    });

    let scheduler = TileScheduler::new(*tile, padded_m, ops.b.n());
    let (tiles_per_expert, experts) = scheduler.grid(ops.b.num_experts());
    let stats = LaunchStats {
        grid_units: tiles_per_expert * experts,
        units_executed,
        elements_written,
    };
    tracing::trace!(
        ?pass,
        block_m = tile.block_m,
        block_n = tile.block_n,
        block_k = tile.block_k,
        grid_units = stats.grid_units,
        units_executed = stats.units_executed,
        "Launched fused projection"
    );
    Ok(stats)
}
