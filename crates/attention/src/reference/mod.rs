//! Reference implementations used to validate the incremental engine.

pub mod exact;

pub use exact::full_sequence_attention;
