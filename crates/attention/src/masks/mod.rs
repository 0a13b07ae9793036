//! Additive attention masks.
//!
//! Masks are f32 tensors shaped `[qlen, klen]` with `0.0` where attention
//! is permitted and `f32::NEG_INFINITY` where it is not; they are broadcast
//! over the head dimension when added to scores.

pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{build_causal_mask, build_first_pass_mask};
