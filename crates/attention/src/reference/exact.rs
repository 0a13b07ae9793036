//! Scalar full-sequence attention oracle.
//!
//! A deliberately naive implementation: plain f32 loops over the whole
//! sequence at once, no cache, no graph, no batched matmuls. Tests compare
//! the incremental engine against this path; the two share no tensor
//! plumbing beyond Candle itself.

use candle_core::{bail, Result as TensorResult, Tensor};

/// Computes causal grouped-query attention over a full sequence.
///
/// `q` is `[seq, heads, head_dim]`, `k`/`v` are `[seq, kv_heads, head_dim]`,
/// all already positionally encoded. `bias`, when given, is
/// `[heads, seq, seq]` and added to raw scores before masking. Returns
/// `[seq, heads, head_dim]` in f32.
pub fn full_sequence_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scaling: bool,
    bias: Option<&Tensor>,
) -> TensorResult<Tensor> {
    let (seq, heads, head_dim) = q.dims3()?;
    let (k_seq, kv_heads, k_dim) = k.dims3()?;
    if k_seq != seq || k_dim != head_dim || v.dims3()? != (k_seq, kv_heads, k_dim) {
        bail!(
            "reference attention shape mismatch: q={:?} k={:?} v={:?}",
            q.dims(),
            k.dims(),
            v.dims()
        );
    }
    if heads % kv_heads != 0 {
        bail!("head count {heads} not divisible by kv head count {kv_heads}");
    }
    let group = heads / kv_heads;

    let q = q.to_dtype(candle_core::DType::F32)?.to_vec3::<f32>()?;
    let k = k.to_dtype(candle_core::DType::F32)?.to_vec3::<f32>()?;
    let v = v.to_dtype(candle_core::DType::F32)?.to_vec3::<f32>()?;
    let bias = match bias {
        Some(bias) => Some(bias.to_dtype(candle_core::DType::F32)?.to_vec3::<f32>()?),
        None => None,
    };

    let scale = if scaling {
        1.0 / (head_dim as f32).sqrt()
    } else {
        1.0
    };

    let mut output = vec![0.0f32; seq * heads * head_dim];
    for head in 0..heads {
        let kv_head = head / group;
        for i in 0..seq {
            // Causal: token i attends to [0, i].
            let mut scores = Vec::with_capacity(i + 1);
            for j in 0..=i {
                let mut dot = 0.0f32;
                for d in 0..head_dim {
                    dot += q[i][head][d] * k[j][kv_head][d];
                }
                let mut score = dot * scale;
                if let Some(bias) = &bias {
                    score += bias[head][i][j];
                }
                scores.push(score);
            }

            let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0.0f32;
            for score in scores.iter_mut() {
                *score = (*score - max).exp();
                denom += *score;
            }

            let row = &mut output[(i * heads + head) * head_dim..][..head_dim];
            for (j, weight) in scores.iter().enumerate() {
                let w = weight / denom;
                for d in 0..head_dim {
                    row[d] += w * v[j][kv_head][d];
                }
            }
        }
    }

    Tensor::from_vec(output, (seq, heads, head_dim), &candle_core::Device::Cpu)
}
