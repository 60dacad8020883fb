use candle_core::{DType, Device, Result, Tensor};

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Naive per-token MoE forward in `f32`: for every token and slot, gather
/// the expert's weights, project, apply SwiGLU, project back, scale by the
/// gating weight and accumulate.
pub fn reference_moe_forward(
    hidden: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    topk_weights: &Tensor,
    topk_ids: &Tensor,
) -> Result<Tensor> {
    let (num_tokens, _) = hidden.dims2()?;
    let (_, out_width, _) = w2.dims3()?;
    let x: Vec<Vec<f32>> = hidden.to_dtype(DType::F32)?.to_vec2()?;
    let w1: Vec<Vec<Vec<f32>>> = w1.to_dtype(DType::F32)?.to_vec3()?;
    let w2: Vec<Vec<Vec<f32>>> = w2.to_dtype(DType::F32)?.to_vec3()?;
    let weights: Vec<Vec<f32>> = topk_weights.to_dtype(DType::F32)?.to_vec2()?;
    let ids: Vec<Vec<i64>> = topk_ids.to_dtype(DType::I64)?.to_vec2()?;

    let mut out = Vec::with_capacity(num_tokens * out_width);
    for (t, row) in x.iter().enumerate() {
        let mut acc = vec![0f32; out_width];
        for (slot, &e) in ids[t].iter().enumerate() {
            let e = e as usize;
            let gate_up: Vec<f32> = w1[e].iter().map(|w| dot(w, row)).collect();
            let ffn = gate_up.len() / 2;
            let act: Vec<f32> = (0..ffn)
                .map(|j| silu(gate_up[j]) * gate_up[ffn + j])
                .collect();
            for (o, w) in acc.iter_mut().zip(&w2[e]) {
                *o += weights[t][slot] * dot(w, &act);
            }
        }
        out.extend(acc);
    }
    Tensor::from_vec(out, (num_tokens, out_width), &Device::Cpu)
}
