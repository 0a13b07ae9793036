//! Fixed-capacity key/value cache with sliding-window compaction.
//!
//! Layout is bit-relevant for anyone serializing session state: the key
//! buffer is `[capacity, kv_hidden]` row-major, the value buffer is
//! `[kv_hidden, capacity]` (transposed) so the weighted-sum matmul reads
//! contiguous value rows per feature. Buffers are allocated once and
//! mutated in place; a session reset only drops `valid_len` back to zero.
//!
//! Sliding-window eviction is staged through [`KvCache::request_shift`] and
//! resolved by the next forward pass: compaction is a single bounded block
//! move per buffer, after which the pending state is gone. No forward call
//! may return while a shift is still pending.

use std::cell::Cell;
use std::marker::PhantomData;

use candle_core::{DType, Device, Result as TensorResult, Tensor};

use crate::core::{AttentionError, Result};
use crate::graph::SharedBuffer;

/// Staged sliding-window eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftState {
    Idle,
    /// `discard` oldest tokens out of `total` cached are to be dropped
    /// before the next write.
    Pending { discard: usize, total: usize },
}

/// Per-layer key/value store for one session.
pub struct KvCache {
    keys: SharedBuffer,
    values: SharedBuffer,
    capacity: usize,
    kv_hidden: usize,
    valid_len: usize,
    shift: ShiftState,
    // One session owns this cache; forward passes must not run concurrently.
    _single_session: PhantomData<Cell<()>>,
}

impl KvCache {
    /// Allocates zeroed buffers for `capacity` token slots.
    pub fn new(capacity: usize, kv_hidden: usize, dtype: DType, device: &Device) -> Result<Self> {
        if capacity == 0 || kv_hidden == 0 {
            return Err(AttentionError::config(
                "cache capacity and kv_hidden must be non-zero",
            ));
        }
        let keys = Tensor::zeros((capacity, kv_hidden), dtype, device)?;
        let values = Tensor::zeros((kv_hidden, capacity), dtype, device)?;
        Ok(Self {
            keys: SharedBuffer::new(keys),
            values: SharedBuffer::new(values),
            capacity,
            kv_hidden,
            valid_len: 0,
            shift: ShiftState::Idle,
            _single_session: PhantomData,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kv_hidden(&self) -> usize {
        self.kv_hidden
    }

    /// Number of token slots currently holding live data.
    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    pub fn shift_pending(&self) -> bool {
        matches!(self.shift, ShiftState::Pending { .. })
    }

    /// Logically empties the cache for a fresh session; buffers are reused.
    pub fn reset(&mut self) {
        self.valid_len = 0;
        self.shift = ShiftState::Idle;
    }

    /// Stages the eviction of the `discard` oldest cached tokens.
    ///
    /// `total` is the caller's view of the cached length and must match; the
    /// shift takes effect at the start of the next forward pass.
    pub fn request_shift(&mut self, discard: usize, total: usize) -> Result<()> {
        if self.shift_pending() {
            return Err(AttentionError::ShiftAlreadyPending);
        }
        if total != self.valid_len || discard > total {
            return Err(AttentionError::InvalidShift {
                discard,
                total,
                cached: self.valid_len,
            });
        }
        if discard == 0 {
            return Ok(());
        }
        log::debug!("staging shift: discard {discard} of {total} cached tokens");
        self.shift = ShiftState::Pending { discard, total };
        Ok(())
    }

    /// The staged shift, if any, as `(discard, remain)`; left in place.
    pub(crate) fn pending_shift(&self) -> Option<(usize, usize)> {
        match self.shift {
            ShiftState::Idle => None,
            ShiftState::Pending { discard, total } => Some((discard, total - discard)),
        }
    }

    /// Consumes the staged shift, if any, returning `(discard, remain)`.
    pub(crate) fn take_pending_shift(&mut self) -> Option<(usize, usize)> {
        match std::mem::replace(&mut self.shift, ShiftState::Idle) {
            ShiftState::Idle => None,
            ShiftState::Pending { discard, total } => Some((discard, total - discard)),
        }
    }

    /// Applies the bookkeeping half of a shift; the data move is
    /// [`KvCache::compact`].
    pub(crate) fn note_compacted(&mut self, remain: usize) {
        self.valid_len = remain;
    }

    /// Records that rows `[0, len)` now hold live data.
    pub(crate) fn set_valid_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity);
        self.valid_len = len;
    }

    /// Moves key rows and value columns `[discard, discard + remain)` down
    /// to `[0, remain)`. One contiguous block copy per buffer; with
    /// `remain == 0` there is nothing to move.
    pub fn compact(&self, discard: usize, remain: usize) -> TensorResult<()> {
        compact_buffers(&self.keys, &self.values, discard, remain)
    }

    /// Writes `rows` (`[qlen, kv_hidden]`) at token offset `offset`.
    pub fn write_key_rows(&self, offset: usize, rows: &Tensor) -> TensorResult<()> {
        self.keys.snapshot().slice_set(&rows.contiguous()?, 0, offset)
    }

    /// Writes `cols` (`[kv_hidden, qlen]`) at token offset `offset`.
    pub fn write_value_cols(&self, offset: usize, cols: &Tensor) -> TensorResult<()> {
        self.values.snapshot().slice_set(&cols.contiguous()?, 1, offset)
    }

    /// Key rows `[0, len)`, shaped `[len, kv_hidden]`.
    pub fn key_rows(&self, len: usize) -> TensorResult<Tensor> {
        self.keys.snapshot().narrow(0, 0, len)
    }

    /// Value columns `[0, len)`, shaped `[kv_hidden, len]`.
    pub fn value_cols(&self, len: usize) -> TensorResult<Tensor> {
        self.values.snapshot().narrow(1, 0, len)
    }

    /// Shared handles for graph closures that mutate the cache at execution
    /// time.
    pub(crate) fn buffers(&self) -> (SharedBuffer, SharedBuffer) {
        (self.keys.clone(), self.values.clone())
    }
}

/// The block move behind [`KvCache::compact`], callable from queued graph
/// closures that only hold buffer handles.
pub(crate) fn compact_buffers(
    keys: &SharedBuffer,
    values: &SharedBuffer,
    discard: usize,
    remain: usize,
) -> TensorResult<()> {
    if remain == 0 {
        return Ok(());
    }
    let key_buffer = keys.snapshot();
    let key_block = key_buffer.narrow(0, discard, remain)?.copy()?;
    key_buffer.slice_set(&key_block, 0, 0)?;

    let value_buffer = values.snapshot();
    let value_block = value_buffer.narrow(1, discard, remain)?.contiguous()?;
    value_buffer.slice_set(&value_block, 1, 0)?;
    Ok(())
}
