//! Per-layer attention configuration.

use candle_core::DType;
use layers::PrecisionPolicy;
use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Precision applied to the score and weighted-sum matmuls.
///
/// Some architectures require f32 accumulation in attention even when the
/// rest of the layer runs in a reduced dtype; this is a per-instance
/// property, not a global default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatmulPrecision {
    /// Run attention matmuls in the storage dtype.
    #[default]
    Inherit,
    /// Promote attention matmuls to f32.
    ForceF32,
}

/// Fixed-at-construction parameters of one attention instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub head_count: usize,
    pub kv_head_count: usize,
    pub head_dim: usize,
    /// Dimensions rotated by rotary variants; `0` means no rotation.
    pub rope_dim: usize,
    pub freq_base: f32,
    pub freq_scale: f32,
    /// YaRN-style extrapolation mix factor; carried for configuration
    /// completeness, inert at its 0.0 default.
    pub ext_factor: f32,
    pub attn_factor: f32,
    /// YaRN ramp bounds; carried alongside `ext_factor`, inert at 0.0.
    pub beta_fast: f32,
    pub beta_slow: f32,
    /// The model's stated maximum context length.
    pub max_length: usize,
    /// Slots allocated in the per-layer KV cache.
    pub cache_capacity: usize,
    pub numeric_precision: MatmulPrecision,
    /// Scales raw scores by `1/sqrt(head_dim)` when set.
    pub scaling_enabled: bool,
}

impl AttentionConfig {
    pub fn new(head_count: usize, kv_head_count: usize, head_dim: usize, max_length: usize) -> Self {
        Self {
            head_count,
            kv_head_count,
            head_dim,
            rope_dim: head_dim,
            freq_base: 10_000.0,
            freq_scale: 1.0,
            ext_factor: 0.0,
            attn_factor: 1.0,
            beta_fast: 0.0,
            beta_slow: 0.0,
            max_length,
            cache_capacity: max_length,
            numeric_precision: MatmulPrecision::Inherit,
            scaling_enabled: true,
        }
    }

    pub fn with_rope_dim(mut self, rope_dim: usize) -> Self {
        self.rope_dim = rope_dim;
        self
    }

    pub fn with_freq_base(mut self, freq_base: f32) -> Self {
        self.freq_base = freq_base;
        self
    }

    pub fn with_freq_scale(mut self, freq_scale: f32) -> Self {
        self.freq_scale = freq_scale;
        self
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    pub fn with_precision(mut self, precision: MatmulPrecision) -> Self {
        self.numeric_precision = precision;
        self
    }

    pub fn with_scaling(mut self, scaling_enabled: bool) -> Self {
        self.scaling_enabled = scaling_enabled;
        self
    }

    /// Validates the invariants that make shapes line up; construction must
    /// fail on violation rather than produce silently wrong geometry.
    pub fn validate(&self) -> Result<()> {
        if self.head_count == 0 || self.kv_head_count == 0 {
            return Err(AttentionError::config("head counts must be non-zero"));
        }
        if self.head_count % self.kv_head_count != 0 {
            return Err(AttentionError::config(format!(
                "head_count {} not divisible by kv_head_count {}",
                self.head_count, self.kv_head_count
            )));
        }
        if self.head_dim == 0 {
            return Err(AttentionError::config("head_dim must be non-zero"));
        }
        if self.rope_dim > self.head_dim {
            return Err(AttentionError::config(format!(
                "rope_dim {} exceeds head_dim {}",
                self.rope_dim, self.head_dim
            )));
        }
        if self.rope_dim % 2 != 0 {
            return Err(AttentionError::config(format!(
                "rope_dim {} must be even",
                self.rope_dim
            )));
        }
        if self.max_length == 0 {
            return Err(AttentionError::config("max_length must be non-zero"));
        }
        if self.cache_capacity < self.max_length {
            return Err(AttentionError::config(format!(
                "cache capacity {} smaller than stated max length {}",
                self.cache_capacity, self.max_length
            )));
        }
        if !(self.freq_base > 0.0) {
            return Err(AttentionError::config("freq_base must be positive"));
        }
        if !(self.freq_scale > 0.0) {
            return Err(AttentionError::config("freq_scale must be positive"));
        }
        Ok(())
    }

    /// Combined width of all query heads.
    pub fn hidden_size(&self) -> usize {
        self.head_count * self.head_dim
    }

    /// Combined width of the key/value heads as stored in the cache.
    pub fn kv_hidden_size(&self) -> usize {
        self.kv_head_count * self.head_dim
    }

    /// Query heads sharing each key/value head.
    pub fn group_size(&self) -> usize {
        self.head_count / self.kv_head_count
    }

    /// Casting rules for the score and weighted-sum matmuls.
    pub fn precision_policy(&self, storage: DType) -> PrecisionPolicy {
        match self.numeric_precision {
            MatmulPrecision::Inherit => PrecisionPolicy::new(storage, storage, DType::F32),
            MatmulPrecision::ForceF32 => PrecisionPolicy::new(storage, DType::F32, DType::F32),
        }
    }
}
