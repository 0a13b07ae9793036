//! Shape and dtype assertions shared by layer constructors and forward paths.
//!
//! All helpers return `candle_core::Result<()>` so call sites propagate
//! violations instead of panicking; the `context` string names the tensor
//! being validated in the resulting error message.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures the tensor has exactly `rank` dimensions.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures the tensor dimensions match `expected` exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {expected:?}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures the last dimension equals `hidden`, for `(seq, hidden)` or
/// `(batch, seq, hidden)` inputs.
pub fn expect_hidden_last(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, h] | [_, _, h] if *h == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{context}: expected trailing dimension {hidden}, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().any(|candidate| *candidate == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Ensures the tensor is contiguous in memory.
pub fn expect_contiguous(context: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{context}: tensor must be contiguous")))
    }
}
