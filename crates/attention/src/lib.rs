//! Attention and KV-cache engine for autoregressive transformer inference.
//!
//! The crate implements the per-layer attention core shared by several
//! model families: grouped/multi-query attention over a fixed-capacity
//! key/value cache, pluggable positional encoding (rotary in both layouts,
//! NTK-mixed rotary, ALiBi, identity), sliding-window context truncation
//! via staged cache compaction, and per-instance matmul precision control.
//!
//! Hidden states use the `(qlen, hidden_size)` convention; a forward pass
//! is assembled as a deferred tensor graph and executed once, with cache
//! writes ordered ahead of the reads of the same pass. One session owns
//! each layer's cache exclusively; forward passes never run concurrently
//! for the same session.

pub mod core;
pub mod graph;
pub mod interop;
pub mod kv_cache;
pub mod masks;
pub mod reference;
pub mod self_attention;

pub use crate::core::{AttentionConfig, AttentionError, MatmulPrecision, Result};
pub use crate::graph::{GraphOp, NodeId, SharedBuffer, TensorGraph};
pub use crate::kv_cache::{KvCache, ShiftState};
pub use crate::self_attention::{ProjectionSet, SelfAttention};
