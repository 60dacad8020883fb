//! Expert segment construction.
//!
//! Flat token-slots (`token * top_k + slot`) are stably sorted by their
//! assigned expert. Each expert then owns one contiguous `[start, end)` range
//! of that permutation. Kernels read the permutation through these ranges
//! instead of materializing per-expert copies of the tokens.

use rayon::prelude::*;

use crate::config::DEFAULT_SEGMENT_BLOCK;

/// Per-expert half-open ranges into a [`DispatchPlan::sorted_idx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertSegments {
    start: Vec<usize>,
    end: Vec<usize>,
}

impl ExpertSegments {
    /// Number of experts the table covers (global id space).
    pub fn num_experts(&self) -> usize {
        self.start.len()
    }

    /// `(start, end)` for `expert`. Experts without tokens yield `(0, 0)`.
    #[inline]
    pub fn bounds(&self, expert: usize) -> (usize, usize) {
        (self.start[expert], self.end[expert])
    }

    #[inline]
    pub fn len(&self, expert: usize) -> usize {
        self.end[expert] - self.start[expert]
    }

    #[inline]
    pub fn is_empty(&self, expert: usize) -> bool {
        self.end[expert] <= self.start[expert]
    }

    pub fn starts(&self) -> &[usize] {
        &self.start
    }

    pub fn ends(&self) -> &[usize] {
        &self.end
    }
}

/// Result of grouping flat token-slots by expert.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    /// Permutation of `0..num_tokens * top_k`, grouped by ascending expert id,
    /// original order within an expert.
    pub sorted_idx: Vec<usize>,
    pub segments: ExpertSegments,
}

impl DispatchPlan {
    /// Number of flat token-slots.
    pub fn len(&self) -> usize {
        self.sorted_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_idx.is_empty()
    }

    /// Token-slots routed to each expert.
    pub fn tokens_per_expert(&self) -> Vec<usize> {
        (0..self.segments.num_experts())
            .map(|e| self.segments.len(e))
            .collect()
    }

    /// Longest segment among `experts` (e.g. a locally resident shard).
    pub fn max_segment_len(&self, experts: std::ops::Range<usize>) -> usize {
        experts.map(|e| self.segments.len(e)).max().unwrap_or(0)
    }
}

/// Builds a [`DispatchPlan`] from flat expert assignments.
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    num_experts: usize,
    block: usize,
}

impl SegmentBuilder {
    pub fn new(num_experts: usize) -> Self {
        Self {
            num_experts,
            block: DEFAULT_SEGMENT_BLOCK,
        }
    }

    /// Permutation positions examined per scan step. Clamped to at least 1.
    pub fn with_block(mut self, block: usize) -> Self {
        self.block = block.max(1);
        self
    }

    /// Group `expert_ids` (flat, one id per token-slot) by expert.
    ///
    /// Every id must be `< num_experts`; callers validate this up front.
    pub fn build(&self, expert_ids: &[u32]) -> DispatchPlan {
        let sorted_idx = sort_by_expert(expert_ids);

        let bounds: Vec<(usize, usize)> = (0..self.num_experts)
            .into_par_iter()
            .map(|expert| scan_expert(expert, &sorted_idx, expert_ids, self.block))
            .collect();
        let (start, end): (Vec<usize>, Vec<usize>) = bounds.into_iter().unzip();

        DispatchPlan {
            sorted_idx,
            segments: ExpertSegments { start, end },
        }
    }
}

/// Stable argsort of flat indices by expert id.
fn sort_by_expert(expert_ids: &[u32]) -> Vec<usize> {
    let mut sorted: Vec<usize> = (0..expert_ids.len()).collect();
    sorted.sort_by_key(|&i| expert_ids[i]);
    sorted
}

/// Blocked scan for one expert: running match count plus the position of the
/// first match. No histogram over the whole id space is built.
fn scan_expert(
    expert: usize,
    sorted_idx: &[usize],
    expert_ids: &[u32],
    block: usize,
) -> (usize, usize) {
    let mut start: Option<usize> = None;
    let mut count = 0usize;

    for (block_idx, chunk) in sorted_idx.chunks(block).enumerate() {
        let mut first_in_block = None;
        let mut block_count = 0usize;
        for (lane, &sid) in chunk.iter().enumerate() {
            if expert_ids[sid] as usize == expert {
                block_count += 1;
                first_in_block.get_or_insert(lane);
            }
        }

        if block_count == 0 {
            // Matches are contiguous in the permutation: an empty block after
            // the segment started means it has ended.
            if start.is_some() {
                break;
            }
            continue;
        }

        count += block_count;
        if start.is_none() {
            start = first_in_block.map(|lane| block_idx * block + lane);
        }
    }

    let start = start.unwrap_or(0);
    (start, start + count)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn assert_plan_invariants(plan: &DispatchPlan, ids: &[u32], num_experts: usize) {
        // Bijection on [0, L).
        let mut seen = vec![false; ids.len()];
        for &sid in &plan.sorted_idx {
            assert!(!seen[sid], "flat index {sid} appears twice");
            seen[sid] = true;
        }
        assert!(seen.iter().all(|&s| s));

        // Each segment holds exactly its expert's slots; union covers [0, L).
        let mut covered = 0;
        for e in 0..num_experts {
            let (start, end) = plan.segments.bounds(e);
            assert!(start <= end);
            let expected = ids.iter().filter(|&&id| id as usize == e).count();
            assert_eq!(end - start, expected, "expert {e} segment length");
            for &sid in &plan.sorted_idx[start..end] {
                assert_eq!(ids[sid] as usize, e);
            }
            covered += end - start;
        }
        assert_eq!(covered, ids.len());
    }

    #[test]
    fn test_segments_basic() {
        // 4 tokens, top_k = 2
        // Token 0 -> experts [2, 3]
        // Token 1 -> experts [1, 2]
        // Token 2 -> experts [1, 3]
        // Token 3 -> experts [1, 2]
        let ids = [2u32, 3, 1, 2, 1, 3, 1, 2];
        let plan = SegmentBuilder::new(4).build(&ids);

        assert_eq!(plan.sorted_idx, vec![2, 4, 6, 0, 3, 7, 1, 5]);
        assert_eq!(plan.segments.bounds(0), (0, 0));
        assert_eq!(plan.segments.bounds(1), (0, 3));
        assert_eq!(plan.segments.bounds(2), (3, 6));
        assert_eq!(plan.segments.bounds(3), (6, 8));
        assert_eq!(plan.tokens_per_expert(), vec![0, 3, 3, 2]);
    }

    #[test]
    fn test_empty_expert_has_empty_range() {
        let ids = [0u32, 0, 2, 2];
        let plan = SegmentBuilder::new(3).build(&ids);
        assert!(plan.segments.is_empty(1));
        assert_eq!(plan.segments.bounds(1), (0, 0));
        assert_eq!(plan.segments.len(1), 0);
    }

    #[test]
    fn test_no_assignments() {
        let plan = SegmentBuilder::new(4).build(&[]);
        assert!(plan.is_empty());
        assert!((0..4).all(|e| plan.segments.is_empty(e)));
    }

    #[test]
    fn test_segment_spanning_blocks() {
        // Small block so segments straddle block boundaries.
        let ids: Vec<u32> = (0..37).map(|i| (i % 3) as u32).collect();
        for block in [1, 2, 5, 8, 64] {
            let plan = SegmentBuilder::new(3).with_block(block).build(&ids);
            assert_plan_invariants(&plan, &ids, 3);
        }
    }

    #[test]
    fn test_deterministic() {
        let ids = [3u32, 1, 1, 0, 3, 2, 1, 0];
        let a = SegmentBuilder::new(4).build(&ids);
        let b = SegmentBuilder::new(4).build(&ids);
        assert_eq!(a.sorted_idx, b.sorted_idx);
        assert_eq!(a.segments, b.segments);
    }

    #[test]
    fn test_randomized_permutation_property() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let num_experts = rng.gen_range(1..12);
            let len = rng.gen_range(0..300);
            let ids: Vec<u32> = (0..len)
                .map(|_| rng.gen_range(0..num_experts) as u32)
                .collect();
            let block = rng.gen_range(1..40);
            let plan = SegmentBuilder::new(num_experts).with_block(block).build(&ids);
            assert_plan_invariants(&plan, &ids, num_experts);
        }
    }

    #[test]
    fn test_max_segment_len_over_shard() {
        let ids = [0u32, 1, 1, 1, 2, 3, 3];
        let plan = SegmentBuilder::new(4).build(&ids);
        assert_eq!(plan.max_segment_len(0..4), 3);
        assert_eq!(plan.max_segment_len(2..4), 2);
        assert_eq!(plan.max_segment_len(0..0), 0);
    }
}
