//! Configuration and error types shared across the attention engine.
//!
//! The engine operates on hidden-state tensors shaped `(qlen, hidden_size)`
//! and keeps per-layer key/value state in fixed-capacity buffers. Everything
//! downstream of these types assumes [`AttentionConfig::validate`] ran at
//! construction time.

pub mod config;
pub mod errors;

pub use config::{AttentionConfig, MatmulPrecision};
pub use errors::{AttentionError, Result};
