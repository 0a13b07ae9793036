//! Error taxonomy for the attention engine.
//!
//! Every variant is a hard failure: configuration problems abort
//! construction, capacity and contract violations abort the forward call.
//! Nothing here is retried or silently truncated.

use thiserror::Error;

/// Failures surfaced by attention construction and forward passes.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The configuration cannot describe a valid layer.
    #[error("invalid attention configuration: {reason}")]
    Config { reason: String },

    /// A write would run past the end of the cache buffers.
    #[error("cache capacity exceeded: position {position} + {qlen} new tokens > capacity {capacity}")]
    CapacityExceeded {
        position: usize,
        qlen: usize,
        capacity: usize,
    },

    /// A staged shift does not match the cache's actual occupancy.
    #[error("invalid shift request: discard {discard} of {total} with {cached} tokens cached")]
    InvalidShift {
        discard: usize,
        total: usize,
        cached: usize,
    },

    /// A new shift was staged while an earlier one had not been consumed.
    #[error("a pending shift must be resolved by a forward call before staging another")]
    ShiftAlreadyPending,

    /// A supplied tensor does not match the documented contract.
    #[error("invalid tensor shape for {context}: {details}")]
    Shape {
        context: &'static str,
        details: String,
    },

    /// A tensor-backend failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(context: &'static str, details: impl Into<String>) -> Self {
        Self::Shape {
            context,
            details: details.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AttentionError>;
