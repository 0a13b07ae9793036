//! Precision and dtype policy shared by the layer and attention crates.
//!
//! Model parameters may be stored in `f16`/`bf16` while matmul-heavy paths
//! promote to `f32`. Some architectures additionally force `f32`
//! accumulation for attention score and weighted-sum matmuls even when the
//! rest of the layer runs in the storage dtype; [`PrecisionPolicy`] carries
//! that decision so every cast goes through one place.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors are cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype, promoting reduced
    /// formats to `f32` for compute and reductions.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as norm statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Overrides the compute dtype, widening the reduction dtype when needed.
    pub fn with_compute(mut self, compute: DType) -> Self {
        self.compute = compute;
        if matches!(compute, DType::F64) {
            self.reduction = compute;
        }
        self
    }

    /// Indicates whether any phase runs in a different dtype than storage.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Comparison tolerance appropriate for the storage dtype.
    pub fn storage_epsilon(&self) -> f32 {
        epsilon_for(self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn reduced_parameter_dtypes_promote_compute() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        assert_eq!(policy.storage(), DType::F16);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(policy.reduction(), DType::F32);
        assert!(policy.is_mixed_precision());
    }

    #[test]
    fn full_precision_parameters_stay_put() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert_eq!(policy.compute(), DType::F32);
        assert!(!policy.is_mixed_precision());
    }

    #[test]
    fn cast_round_trip_stays_within_tolerance() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let base = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &device)?;
        let storage = base.to_dtype(policy.storage())?;

        let compute = policy.cast_for_matmul(&storage)?;
        assert_eq!(compute.dtype(), policy.compute());

        let restored = policy
            .cast_to_storage(&compute)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        let eps = policy.storage_epsilon();
        for (orig, rest) in base.to_vec1::<f32>()?.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= eps);
        }
        Ok(())
    }
}
