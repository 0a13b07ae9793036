//! ALiBi: attention with linear biases.
//!
//! Instead of rotating queries and keys, each head adds a distance-linear
//! penalty to its raw attention scores. Head `h` gets slope `m_h` derived
//! from `max_bias` and the head count, and the score for query position `i`
//! attending to key position `j` receives `-m_h * |i - j|`.
//!
//! Slopes follow the power-of-two scheme: with `f = 2^floor(log2(heads))`,
//! heads below `f` use `(2^(-max_bias/f))^(h+1)` and the remainder
//! interleave with `(2^(-max_bias/(2f)))^(2(h-f)+1)`.

use candle_core::{bail, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Head count and bias ceiling for ALiBi.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlibiParams {
    pub head_count: usize,
    pub max_bias: f32,
}

impl AlibiParams {
    pub fn new(head_count: usize) -> Self {
        Self {
            head_count,
            max_bias: 8.0,
        }
    }

    pub fn with_max_bias(mut self, max_bias: f32) -> Self {
        self.max_bias = max_bias;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_count == 0 {
            bail!("head_count must be non-zero");
        }
        if !(self.max_bias > 0.0) {
            bail!("max_bias must be positive, got {}", self.max_bias);
        }
        Ok(())
    }
}

/// Per-head slopes, largest first.
pub fn alibi_slopes(head_count: usize, max_bias: f32) -> Vec<f32> {
    let floor_pow2 = 1usize << (usize::BITS - 1 - head_count.leading_zeros());
    let m0 = 2f64.powf(-(max_bias as f64) / floor_pow2 as f64);
    let m1 = 2f64.powf(-(max_bias as f64) / (2 * floor_pow2) as f64);

    (0..head_count)
        .map(|h| {
            if h < floor_pow2 {
                m0.powi(h as i32 + 1) as f32
            } else {
                m1.powi(2 * (h - floor_pow2) as i32 + 1) as f32
            }
        })
        .collect()
}

/// Builds the additive bias tensor `[head_count, qlen, klen]` in f32.
///
/// Query row `i` corresponds to absolute position `n_past + i`; key columns
/// cover `[0, klen)`. Entries are `-slope_h * |position_i - j|`.
pub fn build_alibi_bias(
    params: &AlibiParams,
    qlen: usize,
    n_past: usize,
    klen: usize,
    device: &Device,
) -> Result<Tensor> {
    params.validate()?;
    if qlen == 0 || klen == 0 {
        bail!("alibi bias requires non-empty query and key extents");
    }

    let slopes = alibi_slopes(params.head_count, params.max_bias);
    let mut data = Vec::with_capacity(params.head_count * qlen * klen);
    for &slope in &slopes {
        for i in 0..qlen {
            let position = (n_past + i) as i64;
            for j in 0..klen {
                let distance = (position - j as i64).abs() as f32;
                data.push(-slope * distance);
            }
        }
    }
    Tensor::from_vec(data, (params.head_count, qlen, klen), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slopes_for_power_of_two_heads() {
        let slopes = alibi_slopes(8, 8.0);
        assert_eq!(slopes.len(), 8);
        // f = 8, m0 = 2^-1: slopes halve per head.
        for (h, &slope) in slopes.iter().enumerate() {
            let expected = 0.5f32.powi(h as i32 + 1);
            assert!((slope - expected).abs() < 1e-7);
        }
    }

    #[test]
    fn slopes_for_non_power_of_two_heads() {
        let slopes = alibi_slopes(6, 8.0);
        assert_eq!(slopes.len(), 6);
        // f = 4, m0 = 2^-2, m1 = 2^-1.
        for h in 0..4 {
            let expected = 0.25f32.powi(h as i32 + 1);
            assert!((slopes[h] - expected).abs() < 1e-7);
        }
        for h in 4..6 {
            let expected = 0.5f32.powi(2 * (h as i32 - 4) + 1);
            assert!((slopes[h] - expected).abs() < 1e-7);
        }
    }

    #[test]
    fn bias_decreases_with_distance() -> Result<()> {
        let params = AlibiParams::new(4);
        let bias = build_alibi_bias(&params, 1, 5, 6, &Device::Cpu)?;
        assert_eq!(bias.dims(), &[4, 1, 6]);

        let rows = bias.to_vec3::<f32>()?;
        for head in &rows {
            let row = &head[0];
            // Query position is 5; bias peaks at j == 5 and strictly
            // decreases as the distance grows.
            assert_eq!(row[5], 0.0);
            for j in 0..5 {
                assert!(row[j] < row[j + 1]);
            }
        }
        Ok(())
    }

    #[test]
    fn bias_scales_with_head_slope() -> Result<()> {
        let params = AlibiParams::new(2);
        let bias = build_alibi_bias(&params, 1, 3, 4, &Device::Cpu)?;
        let rows = bias.to_vec3::<f32>()?;
        let slopes = alibi_slopes(2, 8.0);
        for (h, head) in rows.iter().enumerate() {
            for (j, &value) in head[0].iter().enumerate() {
                let expected = -slopes[h] * (3i64 - j as i64).abs() as f32;
                assert!((value - expected).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_empty_extents() {
        let params = AlibiParams::new(2);
        assert!(build_alibi_bias(&params, 0, 0, 4, &Device::Cpu).is_err());
        assert!(build_alibi_bias(&params, 1, 0, 0, &Device::Cpu).is_err());
    }
}
