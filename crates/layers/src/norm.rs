//! Normalisation layers.
//!
//! Both variants compute their statistics in the reduction dtype of the
//! supplied [`PrecisionPolicy`] so `f16`/`bf16` parameter stacks stay stable.

use candle_core::{Result, Tensor};

use crate::checks::expect_hidden_last;
use crate::dtypes::PrecisionPolicy;

/// Classic layer normalisation with learned scale and shift.
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let hidden = self.weight.dims1()?;
        expect_hidden_last("layer_norm input", input, hidden)?;
        let x = policy.cast_for_reduction(input)?;
        let mean = x.mean_keepdim(candle_core::D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let scaled = normed
            .broadcast_mul(&policy.cast_for_reduction(&self.weight)?)?
            .broadcast_add(&policy.cast_for_reduction(&self.bias)?)?;
        policy.cast_to_storage(&scaled)
    }
}

/// RMS normalisation, the LLaMA-family variant without mean subtraction.
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let hidden = self.weight.dims1()?;
        expect_hidden_last("rms_norm input", input, hidden)?;
        let x = policy.cast_for_reduction(input)?;
        let mean_sq = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let normed = x.broadcast_div(&(mean_sq + self.eps)?.sqrt()?)?;
        let scaled = normed.broadcast_mul(&policy.cast_for_reduction(&self.weight)?)?;
        policy.cast_to_storage(&scaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    #[test]
    fn layer_norm_zero_mean_unit_variance() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::ones((4,), DType::F32, &device)?;
        let bias = Tensor::zeros((4,), DType::F32, &device)?;
        let norm = LayerNorm::new(weight, bias, 1e-5);

        let input = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], (1, 4), &device)?;
        let output = norm.forward(&input, &policy())?.to_vec2::<f32>()?;

        let mean: f32 = output[0].iter().sum::<f32>() / 4.0;
        let var: f32 = output[0].iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn rms_norm_matches_manual_computation() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::from_slice(&[2.0f32, 2.0, 2.0], (3,), &device)?;
        let norm = RmsNorm::new(weight, 1e-6);

        let values = [3.0f32, 4.0, 12.0];
        let input = Tensor::from_slice(&values, (1, 3), &device)?;
        let output = norm.forward(&input, &policy())?.to_vec2::<f32>()?;

        let rms = (values.iter().map(|v| v * v).sum::<f32>() / 3.0 + 1e-6).sqrt();
        for (got, want) in output[0].iter().zip(values.iter().map(|v| 2.0 * v / rms)) {
            assert!((got - want).abs() < 1e-5);
        }
        Ok(())
    }
}
