//! Activation catalogue for the feed-forward variants.
//!
//! Activations consume tensors shaped `(seq, hidden)` (or any layout, they
//! are elementwise) and return the same layout. Inputs are promoted to the
//! compute dtype of the supplied [`PrecisionPolicy`] before evaluating the
//! non-linearity and cast back to the storage dtype afterwards.
//!
//! GELU uses the erf-based form `0.5 * x * (1 + erf(x / sqrt(2)))`; SiLU is
//! `x * sigmoid(x)` via the fused Candle kernel.

use std::sync::Arc;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity an [`Activation`] implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    /// Pass-through, useful when wiring custom stacks.
    Identity,
    /// GELU with the erf formulation used by GPT-style models.
    Gelu,
    /// SiLU (swish), the gate non-linearity of LLaMA-style MLPs.
    Silu,
}

/// Common interface for the supported activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self.kind {
            ActivationKind::Identity => policy.cast_to_storage(input),
            ActivationKind::Gelu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.gelu_erf()?)
            }
            ActivationKind::Silu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.silu()?)
            }
        }
    }
}

/// Returns a shared activation implementation backed by Candle kernels.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn gelu_matches_erf_formula() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::Gelu);
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = activation.forward(&input, &policy)?;

        let reference = {
            let scaled = input.affine(1.0 / SQRT_2, 0.0)?;
            let inner = (Tensor::ones_like(&input)? + scaled.erf()?)?;
            input.affine(0.5, 0.0)?.mul(&inner)?
        };

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn silu_matches_swish_reference() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::Silu);
        let input = Tensor::from_slice(&[-3.0f32, -1.0, 0.0, 0.5, 2.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = activation.forward(&input, &policy)?;

        let one = Tensor::ones_like(&input)?;
        let sigmoid = one.broadcast_div(&(Tensor::ones_like(&input)? + input.neg()?.exp()?)?)?;
        let reference = input.mul(&sigmoid)?;

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn identity_preserves_values_and_dtype() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::Identity);
        let input = Tensor::from_slice(&[1.0f32, -2.0], (2,), &device)?.to_dtype(DType::F16)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let output = activation.forward(&input, &policy)?;
        assert_eq!(output.dtype(), DType::F16);
        let diff = output
            .to_dtype(DType::F32)?
            .sub(&input.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
