use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

/// Random routed MoE problem on the CPU, all tensors `f32` except the ids.
#[derive(Debug, Clone)]
pub struct MoeProblem {
    /// `(M, H)`
    pub hidden: Tensor,
    /// `(E, 2 * F, H)`
    pub w1: Tensor,
    /// `(E, H, F)`
    pub w2: Tensor,
    /// `(M, top_k)` f32, each row sums to one.
    pub topk_weights: Tensor,
    /// `(M, top_k)` u32, distinct experts per token.
    pub topk_ids: Tensor,
    pub top_k: usize,
    pub num_experts: usize,
}

fn uniform(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0) * scale).collect()
}

impl MoeProblem {
    /// Same seed, same problem.
    pub fn random(
        seed: u64,
        num_tokens: usize,
        hidden: usize,
        ffn: usize,
        num_experts: usize,
        top_k: usize,
    ) -> Result<Self> {
        if top_k > num_experts {
            candle_core::bail!("top_k {top_k} exceeds {num_experts} experts");
        }
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(seed);

        let h = uniform(&mut rng, num_tokens * hidden, 1.0);
        let w1 = uniform(
            &mut rng,
            num_experts * 2 * ffn * hidden,
            1.0 / (hidden as f32).sqrt(),
        );
        let w2 = uniform(&mut rng, num_experts * hidden * ffn, 1.0 / (ffn as f32).sqrt());

        let mut ids = Vec::with_capacity(num_tokens * top_k);
        let mut weights = Vec::with_capacity(num_tokens * top_k);
        for _ in 0..num_tokens {
            ids.extend(sample(&mut rng, num_experts, top_k).into_iter().map(|e| e as u32));
            let raw: Vec<f32> = (0..top_k).map(|_| rng.gen_range(0.1f32..1.0)).collect();
            let sum: f32 = raw.iter().sum();
            weights.extend(raw.into_iter().map(|w| w / sum));
        }

        Ok(Self {
            hidden: Tensor::from_vec(h, (num_tokens, hidden), &device)?,
            w1: Tensor::from_vec(w1, (num_experts, 2 * ffn, hidden), &device)?,
            w2: Tensor::from_vec(w2, (num_experts, hidden, ffn), &device)?,
            topk_weights: Tensor::from_vec(weights, (num_tokens, top_k), &device)?,
            topk_ids: Tensor::from_vec(ids, (num_tokens, top_k), &device)?,
            top_k,
            num_experts,
        })
    }

    /// Activations and weights cast to `dtype`; routing tensors unchanged.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        Ok(Self {
            hidden: self.hidden.to_dtype(dtype)?,
            w1: self.w1.to_dtype(dtype)?,
            w2: self.w2.to_dtype(dtype)?,
            ..self.clone()
        })
    }

    /// `(w1, w2)` restricted to experts `[offset, offset + count)`.
    pub fn shard(&self, offset: usize, count: usize) -> Result<(Tensor, Tensor)> {
        Ok((self.w1.narrow(0, offset, count)?, self.w2.narrow(0, offset, count)?))
    }

    pub fn num_tokens(&self) -> usize {
        self.hidden.dims()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_problem_is_deterministic() {
        let a = MoeProblem::random(11, 5, 8, 4, 6, 3).unwrap();
        let b = MoeProblem::random(11, 5, 8, 4, 6, 3).unwrap();
        let ids_a: Vec<Vec<u32>> = a.topk_ids.to_vec2().unwrap();
        let ids_b: Vec<Vec<u32>> = b.topk_ids.to_vec2().unwrap();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.w1.dims(), &[6, 8, 8]);
        assert_eq!(a.w2.dims(), &[6, 8, 4]);
    }

    #[test]
    fn test_routing_is_distinct_and_normalized() {
        let p = MoeProblem::random(12, 16, 4, 4, 8, 4).unwrap();
        let ids: Vec<Vec<u32>> = p.topk_ids.to_vec2().unwrap();
        let weights: Vec<Vec<f32>> = p.topk_weights.to_vec2().unwrap();
        for (row, w) in ids.iter().zip(&weights) {
            let mut sorted = row.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), 4);
            assert!(row.iter().all(|&e| e < 8));
            assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_top_k_larger_than_experts_rejected() {
        assert!(MoeProblem::random(0, 1, 4, 4, 2, 3).is_err());
    }
}
