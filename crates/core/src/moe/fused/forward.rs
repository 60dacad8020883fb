//! Two-pass fused MoE forward.
//!
//! ```text
//! expert ids ──▶ SegmentBuilder ──▶ (sorted_idx, segments)
//!                                          │
//! hidden ──▶ gate/up pass ──▶ cache1 ──▶ activation ──▶ down pass ──▶ cache2 ──▶ Σ top-k
//!            (reindex A)     (sorted)                  (reindex C,  (per slot)
//!                                                       gating)
//! ```

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use super::activation::{GatedActivation, SiluAndMul};
use super::autotune::Autotuner;
use super::buffer::{BufferInit, IntermediateBuffer};
use super::config::{padded_rows, AutotuneKey, TileConfig};
use super::kernel::{ProjectionOperands, ProjectionPass};
use super::kernel_wrapper::{bench_projection, launch_projection};
use super::operand::{cpu_slice, ExpertWeights, KernelElement, MatrixView};
use super::segments::{DispatchPlan, SegmentBuilder};
use crate::config::FusedMoeConfig;
use crate::error::{MoeError, Result};

/// Per-call routing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusedMoeParams {
    pub top_k: usize,
    /// Global id of the first locally resident expert.
    pub expert_offset: usize,
    /// Total experts referenced by the routing ids. `None` means every
    /// expert is local (the leading dim of `w1`).
    pub num_experts: Option<usize>,
    /// Rescale each token's gating weights to sum to one.
    pub renormalize: bool,
}

impl FusedMoeParams {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            expert_offset: 0,
            num_experts: None,
            renormalize: false,
        }
    }

    /// Process only experts `[expert_offset, expert_offset + E_local)` of
    /// `num_experts`.
    pub fn with_shard(mut self, expert_offset: usize, num_experts: usize) -> Self {
        self.expert_offset = expert_offset;
        self.num_experts = Some(num_experts);
        self
    }

    pub fn with_renormalize(mut self, renormalize: bool) -> Self {
        self.renormalize = renormalize;
        self
    }
}

/// Validated problem dimensions.
#[derive(Debug, Clone, Copy)]
struct ProblemShape {
    num_tokens: usize,
    hidden: usize,
    top_k: usize,
    local_experts: usize,
    total_experts: usize,
    expert_offset: usize,
    gate_up_width: usize,
    ffn: usize,
    out_width: usize,
}

impl ProblemShape {
    fn slots(&self) -> usize {
        self.num_tokens * self.top_k
    }

    fn all_local(&self) -> bool {
        self.local_experts == self.total_experts
    }
}

/// Divide each token's `top_k` weights by their sum. A zero sum leaves the
/// token's weights unchanged.
pub fn renormalize_topk(weights: &mut [f32], top_k: usize) {
    if top_k == 0 {
        return;
    }
    for token in weights.chunks_mut(top_k) {
        let sum: f32 = token.iter().sum();
        if sum != 0.0 {
            token.iter_mut().for_each(|w| *w /= sum);
        }
    }
}

fn rank2(what: &'static str, t: &Tensor) -> Result<(usize, usize)> {
    match t.dims() {
        &[a, b] => Ok((a, b)),
        dims => Err(MoeError::shape(what, &[2], &[dims.len()])),
    }
}

fn rank3(what: &'static str, t: &Tensor) -> Result<(usize, usize, usize)> {
    match t.dims() {
        &[a, b, c] => Ok((a, b, c)),
        dims => Err(MoeError::shape(what, &[3], &[dims.len()])),
    }
}

/// Flat expert ids, each checked against the global expert count.
fn expert_ids(topk_ids: &Tensor, total_experts: usize) -> Result<Vec<u32>> {
    if topk_ids.dtype().is_float() {
        return Err(MoeError::config(format!(
            "topk_ids must be an integer tensor, got {:?}",
            topk_ids.dtype()
        )));
    }
    let raw = topk_ids.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    raw.into_iter()
        .map(|id| match u32::try_from(id) {
            Ok(e) if (e as usize) < total_experts => Ok(e),
            _ => Err(MoeError::config(format!(
                "expert id {id} outside [0, {total_experts})"
            ))),
        })
        .collect()
}

/// Fused MoE feed-forward engine.
#[derive(Debug, Clone)]
pub struct FusedMoe {
    config: FusedMoeConfig,
    activation: Arc<dyn GatedActivation>,
    autotuner: Arc<Autotuner>,
}

impl Default for FusedMoe {
    /// Environment configuration and the process-wide autotune cache.
    fn default() -> Self {
        Self {
            config: FusedMoeConfig::from_env(),
            activation: Arc::new(SiluAndMul),
            autotuner: Autotuner::global(),
        }
    }
}

impl FusedMoe {
    /// Engine with its own autotune cache.
    pub fn new(config: FusedMoeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            autotuner: Arc::new(Autotuner::new(&config)),
            activation: Arc::new(SiluAndMul),
            config,
        })
    }

    pub fn with_activation(mut self, activation: Arc<dyn GatedActivation>) -> Self {
        self.activation = activation;
        self
    }

    /// Share an autotune cache between engines.
    pub fn with_autotuner(mut self, autotuner: Arc<Autotuner>) -> Self {
        self.autotuner = autotuner;
        self
    }

    pub fn config(&self) -> &FusedMoeConfig {
        &self.config
    }

    pub fn autotuner(&self) -> &Arc<Autotuner> {
        &self.autotuner
    }

    /// Run the MoE feed-forward.
    ///
    /// # Arguments
    /// * `hidden_states` - `(M, H)`, f32/f16/bf16
    /// * `w1` - gate/up weights `(E_local, 2 * F, H)`
    /// * `w2` - down weights `(E_local, H_out, F)`
    /// * `topk_weights` - gating weights `(M, top_k)`, any float dtype
    /// * `topk_ids` - global expert ids `(M, top_k)`, integer dtype
    ///
    /// # Returns
    /// `(M, H_out)` in the dtype and on the device of `hidden_states`. Under
    /// sharding, slots routed to non-local experts contribute zero.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        w1: &Tensor,
        w2: &Tensor,
        topk_weights: &Tensor,
        topk_ids: &Tensor,
        params: &FusedMoeParams,
    ) -> Result<Tensor> {
        let shape = self.validate(hidden_states, w1, w2, topk_weights, topk_ids, params)?;
        let device = hidden_states.device().clone();
        let dtype = hidden_states.dtype();

        let ids = expert_ids(topk_ids, shape.total_experts)?;
        let mut weights = topk_weights
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        if params.renormalize {
            renormalize_topk(&mut weights, shape.top_k);
        }

        if shape.num_tokens == 0 {
            return Ok(Tensor::zeros((0, shape.out_width), dtype, &device)?);
        }

        let plan = SegmentBuilder::new(shape.total_experts)
            .with_block(self.config.segment_block)
            .build(&ids);

        let cpu = Device::Cpu;
        let hidden = hidden_states.to_device(&cpu)?;
        let w1 = w1.to_device(&cpu)?;
        let w2 = w2.to_device(&cpu)?;

        let output = match dtype {
            DType::F32 => self.forward_typed::<f32>(&shape, &hidden, &w1, &w2, &weights, &plan)?,
            DType::F16 => self.forward_typed::<f16>(&shape, &hidden, &w1, &w2, &weights, &plan)?,
            DType::BF16 => self.forward_typed::<bf16>(&shape, &hidden, &w1, &w2, &weights, &plan)?,
            other => return Err(MoeError::UnsupportedDType(other)),
        };

        tracing::debug!(
            num_tokens = shape.num_tokens,
            top_k = shape.top_k,
            local_experts = shape.local_experts,
            total_experts = shape.total_experts,
            expert_offset = shape.expert_offset,
            ?dtype,
            "Fused MoE forward"
        );
        Ok(output.to_device(&device)?)
    }

    fn validate(
        &self,
        hidden_states: &Tensor,
        w1: &Tensor,
        w2: &Tensor,
        topk_weights: &Tensor,
        topk_ids: &Tensor,
        params: &FusedMoeParams,
    ) -> Result<ProblemShape> {
        let top_k = params.top_k;
        if top_k == 0 {
            return Err(MoeError::config("top_k must be positive"));
        }

        let (num_tokens, hidden) = rank2("hidden_states rank", hidden_states)?;
        let (local_experts, gate_up_width, k1) = rank3("w1 rank", w1)?;
        let (local_experts2, out_width, k2) = rank3("w2 rank", w2)?;
        if local_experts != local_experts2 {
            return Err(MoeError::config(format!(
                "w1 holds {local_experts} experts but w2 holds {local_experts2}"
            )));
        }

        let total_experts = params.num_experts.unwrap_or(local_experts);
        if total_experts == 0 {
            return Err(MoeError::config("num_experts must be positive"));
        }
        if params.expert_offset + local_experts > total_experts {
            return Err(MoeError::config(format!(
                "local experts [{}, {}) exceed num_experts {total_experts}",
                params.expert_offset,
                params.expert_offset + local_experts
            )));
        }

        if k1 != hidden {
            return Err(MoeError::shape("w1 contraction dim", &[hidden], &[k1]));
        }
        let ffn = self.activation.output_width(gate_up_width);
        if !self.activation.is_valid_width(gate_up_width) {
            return Err(MoeError::shape(
                "w1 gate/up width",
                &[2 * ffn],
                &[gate_up_width],
            ));
        }
        if k2 != ffn {
            return Err(MoeError::shape("w2 contraction dim", &[ffn], &[k2]));
        }

        let dtype = hidden_states.dtype();
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(MoeError::UnsupportedDType(dtype));
        }
        for (name, t) in [("w1", w1), ("w2", w2)] {
            if t.dtype() != dtype {
                return Err(MoeError::config(format!(
                    "{name} dtype {:?} does not match hidden_states dtype {dtype:?}",
                    t.dtype()
                )));
            }
        }

        let routing = [num_tokens, top_k];
        if topk_ids.dims() != routing.as_slice() {
            return Err(MoeError::shape("topk_ids", &routing, topk_ids.dims()));
        }
        if topk_weights.dims() != routing.as_slice() {
            return Err(MoeError::shape("topk_weights", &routing, topk_weights.dims()));
        }

        Ok(ProblemShape {
            num_tokens,
            hidden,
            top_k,
            local_experts,
            total_experts,
            expert_offset: params.expert_offset,
            gate_up_width,
            ffn,
            out_width,
        })
    }

    fn forward_typed<T: KernelElement>(
        &self,
        shape: &ProblemShape,
        hidden: &Tensor,
        w1: &Tensor,
        w2: &Tensor,
        weights: &[f32],
        plan: &DispatchPlan,
    ) -> Result<Tensor> {
        let local = shape.expert_offset..shape.expert_offset + shape.local_experts;
        let padded_m = padded_rows(shape.num_tokens.max(plan.max_segment_len(local)));
        let init = BufferInit::for_shard(shape.all_local());

        let (h_storage, h_layout) = hidden.storage_and_layout();
        let (w1_storage, w1_layout) = w1.storage_and_layout();
        let (w2_storage, w2_layout) = w2.storage_and_layout();

        // Gate/up: token rows in, segment-ordered rows out.
        let gate_up = ProjectionOperands {
            a: MatrixView::from_layout(cpu_slice::<T>(&h_storage)?, h_layout)?,
            b: ExpertWeights::from_layout(cpu_slice::<T>(&w1_storage)?, w1_layout)?,
            sorted_idx: &plan.sorted_idx,
            segments: &plan.segments,
            weights: None,
            expert_offset: shape.expert_offset,
        };
        let pass = ProjectionPass::gate_up(shape.top_k);
        let tile = self.select_tile(&gate_up, pass, padded_m)?;
        let mut cache1 = IntermediateBuffer::<T>::allocate(
            "gate/up cache",
            shape.num_tokens,
            shape.top_k,
            shape.gate_up_width,
            init,
        )?;
        launch_projection(&gate_up, pass, &mut cache1, &tile, padded_m)?;

        let activated = self.activation.apply(&cache1.into_tensor()?)?;
        let expected = [shape.slots(), shape.ffn];
        if activated.dims() != expected.as_slice() {
            return Err(MoeError::shape("activation output", &expected, activated.dims()));
        }

        // Down: segment-ordered rows in, gated rows scattered to their slots.
        let (act_storage, act_layout) = activated.storage_and_layout();
        let down = ProjectionOperands {
            a: MatrixView::from_layout(cpu_slice::<T>(&act_storage)?, act_layout)?,
            b: ExpertWeights::from_layout(cpu_slice::<T>(&w2_storage)?, w2_layout)?,
            weights: Some(weights),
            ..gate_up
        };
        let pass = ProjectionPass::down();
        let tile = self.select_tile(&down, pass, padded_m)?;
        let mut cache2 = IntermediateBuffer::<T>::allocate(
            "down cache",
            shape.num_tokens,
            shape.top_k,
            shape.out_width,
            init,
        )?;
        launch_projection(&down, pass, &mut cache2, &tile, padded_m)?;

        tracing::trace!(
            hidden = shape.hidden,
            ffn = shape.ffn,
            padded_m,
            "Fused MoE passes complete"
        );
        cache2.reduce_topk()?.into_tensor()
    }

    fn select_tile<T: KernelElement>(
        &self,
        ops: &ProjectionOperands<'_, T>,
        pass: ProjectionPass,
        padded_m: usize,
    ) -> Result<TileConfig> {
        let key = AutotuneKey {
            n: ops.b.n(),
            k: ops.b.k(),
            padded_m,
        };
        self.autotuner.select(key, |tile| {
            bench_projection(ops, pass, tile, padded_m);
            Ok(())
        })
    }
}

/// [`FusedMoe::forward`] with the process-wide engine.
pub fn fused_moe(
    hidden_states: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    topk_weights: &Tensor,
    topk_ids: &Tensor,
    params: &FusedMoeParams,
) -> Result<Tensor> {
    FusedMoe::default().forward(hidden_states, w1, w2, topk_weights, topk_ids, params)
}
