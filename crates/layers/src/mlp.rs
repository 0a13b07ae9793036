//! Feed-forward variants used by the supported decoder families.
//!
//! Three shapes show up in practice:
//! - [`MlpFeedForward`]: plain `fc1(act(fc0(x)))`, GPT-style.
//! - [`GatedFeedForward`]: `down(act(gate(x)) * up(x))`, LLaMA-style.
//! - [`FusedGatedFeedForward`]: the gated form with `gate` and `up` stored as
//!   one `(2 * intermediate, hidden)` projection that is split after the
//!   matmul.

use std::sync::Arc;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::activations::{builtin, Activation, ActivationKind};
use crate::checks::expect_rank;
use crate::dtypes::PrecisionPolicy;
use crate::linear::{Linear, LinearConfig};

/// Dimensions and activation selection shared by the feed-forward variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub activation: ActivationKind,
    pub bias: bool,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            bias: false,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Common interface over the feed-forward variants.
pub trait FeedForwardLayer: Send + Sync {
    fn config(&self) -> &FeedForwardConfig;

    /// Maps `(seq, hidden)` input to `(seq, hidden)` output.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Two-projection MLP: `fc1(act(fc0(x)))`.
pub struct MlpFeedForward {
    fc0: Linear,
    fc1: Linear,
    activation: Arc<dyn Activation>,
    config: FeedForwardConfig,
}

impl MlpFeedForward {
    pub fn new(config: FeedForwardConfig, fc0: Linear, fc1: Linear) -> Result<Self> {
        expect_dims(fc0.config(), config.hidden_size, config.intermediate_size)?;
        expect_dims(fc1.config(), config.intermediate_size, config.hidden_size)?;
        Ok(Self {
            fc0,
            fc1,
            activation: builtin(config.activation),
            config,
        })
    }
}

impl FeedForwardLayer for MlpFeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        expect_rank("feed_forward input", input, 2)?;
        let hidden = self.fc0.forward(input, policy)?;
        let activated = self.activation.forward(&hidden, policy)?;
        self.fc1.forward(&activated, policy)
    }
}

/// Gated MLP: `down(act(gate(x)) * up(x))`.
pub struct GatedFeedForward {
    gate: Linear,
    up: Linear,
    down: Linear,
    activation: Arc<dyn Activation>,
    config: FeedForwardConfig,
}

impl GatedFeedForward {
    pub fn new(config: FeedForwardConfig, gate: Linear, up: Linear, down: Linear) -> Result<Self> {
        expect_dims(gate.config(), config.hidden_size, config.intermediate_size)?;
        expect_dims(up.config(), config.hidden_size, config.intermediate_size)?;
        expect_dims(down.config(), config.intermediate_size, config.hidden_size)?;
        Ok(Self {
            gate,
            up,
            down,
            activation: builtin(config.activation),
            config,
        })
    }
}

impl FeedForwardLayer for GatedFeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        expect_rank("feed_forward input", input, 2)?;
        let gated = self.activation.forward(&self.gate.forward(input, policy)?, policy)?;
        let up = self.up.forward(input, policy)?;
        self.down.forward(&gated.mul(&up)?, policy)
    }
}

/// Gated MLP whose gate and up projections share one fused weight.
pub struct FusedGatedFeedForward {
    gate_up: Linear,
    down: Linear,
    activation: Arc<dyn Activation>,
    config: FeedForwardConfig,
}

impl FusedGatedFeedForward {
    pub fn new(config: FeedForwardConfig, gate_up: Linear, down: Linear) -> Result<Self> {
        expect_dims(
            gate_up.config(),
            config.hidden_size,
            2 * config.intermediate_size,
        )?;
        expect_dims(down.config(), config.intermediate_size, config.hidden_size)?;
        Ok(Self {
            gate_up,
            down,
            activation: builtin(config.activation),
            config,
        })
    }
}

impl FeedForwardLayer for FusedGatedFeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        expect_rank("feed_forward input", input, 2)?;
        let fused = self.gate_up.forward(input, policy)?;
        let last = fused.rank() - 1;
        let halves = fused.chunk(2, last)?;
        let gated = self.activation.forward(&halves[0].contiguous()?, policy)?;
        self.down.forward(&gated.mul(&halves[1].contiguous()?)?, policy)
    }
}

fn expect_dims(config: &LinearConfig, input_dim: usize, output_dim: usize) -> Result<()> {
    if config.input_dim != input_dim || config.output_dim != output_dim {
        candle_core::bail!(
            "feed-forward projection expected ({input_dim} -> {output_dim}), got ({} -> {})",
            config.input_dim,
            config.output_dim
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    fn linear(input: usize, output: usize, data: &[f32], device: &Device) -> Result<Linear> {
        let weight = Tensor::from_slice(data, (output, input), device)?;
        Linear::new(LinearConfig::new(input, output), weight, None)
    }

    #[test]
    fn gated_and_fused_agree() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig::new(2, 3, ActivationKind::Silu);

        let gate_data = [0.5f32, -0.25, 1.0, 0.75, -0.5, 0.25];
        let up_data = [1.0f32, 0.5, -0.75, 0.25, 0.5, -1.0];
        let down_data = [0.5f32, -0.5, 1.0, 0.25, 0.75, -0.25];

        let gated = GatedFeedForward::new(
            config,
            linear(2, 3, &gate_data, &device)?,
            linear(2, 3, &up_data, &device)?,
            linear(3, 2, &down_data, &device)?,
        )?;

        let mut fused_data = Vec::new();
        fused_data.extend_from_slice(&gate_data);
        fused_data.extend_from_slice(&up_data);
        let fused = FusedGatedFeedForward::new(
            config,
            linear(2, 6, &fused_data, &device)?,
            linear(3, 2, &down_data, &device)?,
        )?;

        let input = Tensor::from_slice(&[0.4f32, -1.2, 2.0, 0.1], (2, 2), &device)?;
        let a = gated.forward(&input, &policy())?.to_vec2::<f32>()?;
        let b = fused.forward(&input, &policy())?.to_vec2::<f32>()?;
        for (ra, rb) in a.iter().zip(b.iter()) {
            for (va, vb) in ra.iter().zip(rb.iter()) {
                assert!((va - vb).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn mlp_applies_activation_between_projections() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig::new(1, 2, ActivationKind::Identity);
        let mlp = MlpFeedForward::new(
            config,
            linear(1, 2, &[2.0, -3.0], &device)?,
            linear(2, 1, &[1.0, 1.0], &device)?,
        )?;
        let input = Tensor::from_slice(&[1.0f32], (1, 1), &device)?;
        let output = mlp.forward(&input, &policy())?.to_vec2::<f32>()?;
        assert!((output[0][0] - (-1.0)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn rejects_batched_input() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig::new(2, 3, ActivationKind::Silu);
        let mlp = MlpFeedForward::new(
            config,
            linear(2, 3, &[0.0; 6], &device)?,
            linear(3, 2, &[0.0; 6], &device)?,
        )?;
        let input = Tensor::zeros((1, 2, 2), DType::F32, &device)?;
        assert!(mlp.forward(&input, &policy()).is_err());
        Ok(())
    }

    #[test]
    fn rejects_mismatched_projection_dims() {
        let device = Device::Cpu;
        let config = FeedForwardConfig::new(2, 3, ActivationKind::Gelu);
        let bad = linear(2, 2, &[1.0, 0.0, 0.0, 1.0], &device).unwrap();
        let down = linear(3, 2, &[0.0; 6], &device).unwrap();
        let up = linear(2, 3, &[0.0; 6], &device).unwrap();
        assert!(GatedFeedForward::new(config, bad, up, down).is_err());
    }
}
