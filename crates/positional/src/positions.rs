//! Position ranges for incremental decoding.
//!
//! Autoregressive forward passes always process a contiguous run of
//! positions: the prompt pass covers `[0, qlen)` and each decode step covers
//! `[n_past, n_past + 1)`. [`Positions`] captures that range and rejects
//! anything non-contiguous so the encoding layers can index their tables with
//! a single narrow.

use candle_core::{bail, Result};

/// A contiguous run of absolute token positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Positions {
    start: usize,
    len: usize,
}

impl Positions {
    /// Builds a range of `len` positions starting at `start`.
    pub fn contiguous(start: usize, len: usize) -> Result<Self> {
        if len == 0 {
            bail!("position range must not be empty");
        }
        Ok(Self { start, len })
    }

    /// Validates an explicit index list and collapses it to a range.
    pub fn from_indices(indices: &[u32]) -> Result<Self> {
        let Some(&first) = indices.first() else {
            bail!("position list must not be empty");
        };
        for (offset, &position) in indices.iter().enumerate() {
            if position as usize != first as usize + offset {
                bail!(
                    "positions must form a contiguous range starting at {}",
                    first
                );
            }
        }
        Self::contiguous(first as usize, indices.len())
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last position in the range.
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_contiguous_indices() {
        let positions = Positions::from_indices(&[4, 5, 6]).unwrap();
        assert_eq!(positions.start(), 4);
        assert_eq!(positions.len(), 3);
        assert_eq!(positions.end(), 7);
    }

    #[test]
    fn rejects_gaps_and_empty() {
        assert!(Positions::from_indices(&[1, 3]).is_err());
        assert!(Positions::from_indices(&[]).is_err());
        assert!(Positions::contiguous(0, 0).is_err());
    }
}
