//! Positional encoding schemes for autoregressive attention.
//!
//! The crate covers the schemes the attention engine selects between at
//! construction time: classic rotary in both pairing layouts, NTK-mixed
//! rotary for context extension, ALiBi score biases, and an identity
//! fallback. Query/key tensors use the `[seq, heads, head_dim]` convention
//! throughout.

pub mod alibi;
pub mod encoding;
pub mod ntk;
pub mod positions;
pub mod rope;

pub use alibi::{alibi_slopes, build_alibi_bias, AlibiParams};
pub use encoding::PositionalEncoding;
pub use ntk::{ntk_mixed_inv_freq, NtkMixedParams, NtkMixedRotary};
pub use positions::Positions;
pub use rope::{apply_rotary, RotaryLayout, RotaryParams};
