//! Dense projection layer.
//!
//! `Linear` wraps a weight matrix stored `(output_dim, input_dim)` plus an
//! optional bias, the layout Candle's `matmul` consumes after a transpose.
//! Forward accepts `(seq, input_dim)` or `(batch, seq, input_dim)` inputs and
//! applies the [`PrecisionPolicy`] casts around the matmul.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::checks::{expect_contiguous, expect_dtype_in, expect_hidden_last, expect_shape};
use crate::dtypes::PrecisionPolicy;

/// Dimensions and bias selection for a [`Linear`] projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub bias: bool,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// A dense `y = x W^T + b` projection.
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
    config: LinearConfig,
}

impl Linear {
    /// Builds the layer from an explicit weight `(output_dim, input_dim)` and
    /// optional bias `(output_dim,)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        expect_shape(
            "linear weight",
            &weight,
            &[config.output_dim, config.input_dim],
        )?;
        expect_dtype_in(
            "linear weight",
            &weight,
            &[DType::BF16, DType::F16, DType::F32, DType::F64],
        )?;
        expect_contiguous("linear weight", &weight)?;
        if config.bias != bias.is_some() {
            candle_core::bail!(
                "linear bias mismatch: config.bias={} but bias tensor {}",
                config.bias,
                if bias.is_some() { "present" } else { "absent" }
            );
        }
        if let Some(b) = &bias {
            expect_shape("linear bias", b, &[config.output_dim])?;
        }
        Ok(Self {
            weight,
            bias,
            config,
        })
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Projects the input, promoting to the compute dtype for the matmul and
    /// casting the result back to storage.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        expect_hidden_last("linear input", input, self.config.input_dim)?;
        let compute = policy.cast_for_matmul(input)?;
        let weight = policy.cast_for_matmul(&self.weight)?;
        let projected = match *input.dims() {
            [_, _] => compute.matmul(&weight.t()?)?,
            [batch, seq, _] => {
                let flat = compute.reshape((batch * seq, self.config.input_dim))?;
                flat.matmul(&weight.t()?)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            _ => candle_core::bail!("linear input must be rank 2 or 3"),
        };
        let projected = match &self.bias {
            Some(bias) => projected.broadcast_add(&policy.cast_for_matmul(bias)?)?,
            None => projected,
        };
        policy.cast_to_storage(&projected)
    }
}
