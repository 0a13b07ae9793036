//! Building blocks consumed by the attention engine.
//!
//! The crate bundles the pieces a decoder layer assembles around the
//! attention core: dense projections, activation functions, normalisation,
//! the mixed-precision casting policy, and the feed-forward variants used by
//! the supported model families. Everything operates on Candle tensors with
//! the `(seq, hidden)` convention (a leading batch dimension is accepted
//! where documented).

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use activations::{builtin, Activation, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig};
pub use mlp::{
    FeedForwardConfig, FeedForwardLayer, FusedGatedFeedForward, GatedFeedForward, MlpFeedForward,
};
pub use norm::{LayerNorm, RmsNorm};
