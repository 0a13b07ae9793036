//! NTK-mixed rotary encoding for context-length extension.
//!
//! The inverse-frequency spectrum is not a pure geometric sequence: each
//! dimension pair `j` gets `base^(-2j/dim) / exp(a * (j+1)^b)` where
//! `a = ln(k) / (dim/2)^b`. Low-frequency dimensions are compressed more
//! aggressively than high-frequency ones, which stretches the usable context
//! without retraining. Once frequencies are derived, rotation proceeds
//! exactly as in classic rotary.
//!
//! The spectrum depends only on the rotated dimension count, so it is built
//! lazily and rebuilt only when that dimension changes.

use std::sync::{Arc, Mutex};

use candle_core::{bail, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::positions::Positions;
use crate::rope::{rotate_block, sin_cos_tables, RotaryLayout};

/// Parameters of the NTK-mixed rotary encoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NtkMixedParams {
    pub head_dim: usize,
    pub rope_dim: usize,
    pub freq_base: f32,
    pub freq_scale: f32,
    pub attn_factor: f32,
    /// Scaling hyperparameter `k`; larger values stretch the context further.
    pub scaling_factor: f32,
    /// Power hyperparameter `b` shaping the per-dimension mix curve.
    pub scaling_power: f32,
    pub layout: RotaryLayout,
}

impl NtkMixedParams {
    pub fn new(head_dim: usize, rope_dim: usize, scaling_factor: f32, scaling_power: f32) -> Self {
        Self {
            head_dim,
            rope_dim,
            freq_base: 10_000.0,
            freq_scale: 1.0,
            attn_factor: 1.0,
            scaling_factor,
            scaling_power,
            layout: RotaryLayout::Interleaved,
        }
    }

    pub fn with_freq_base(mut self, freq_base: f32) -> Self {
        self.freq_base = freq_base;
        self
    }

    pub fn with_layout(mut self, layout: RotaryLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        if self.rope_dim == 0 || self.rope_dim % 2 != 0 {
            bail!("rope_dim must be even and non-zero, got {}", self.rope_dim);
        }
        if self.rope_dim > self.head_dim {
            bail!(
                "rope_dim {} exceeds head_dim {}",
                self.rope_dim,
                self.head_dim
            );
        }
        if !(self.freq_base > 0.0) {
            bail!("freq_base must be positive, got {}", self.freq_base);
        }
        if !(self.scaling_factor > 0.0) {
            bail!(
                "scaling_factor must be positive, got {}",
                self.scaling_factor
            );
        }
        Ok(())
    }
}

/// Builds the NTK-mixed inverse-frequency spectrum for `dim` rotated
/// dimensions (`dim / 2` pairs).
pub fn ntk_mixed_inv_freq(dim: usize, base: f32, scaling_factor: f32, scaling_power: f32) -> Vec<f32> {
    let half = dim / 2;
    let a = (scaling_factor as f64).ln() / (half as f64).powf(scaling_power as f64);
    (0..half)
        .map(|j| {
            let geometric = (base as f64).powf(-((2 * j) as f64) / dim as f64);
            let mix = (a * ((j + 1) as f64).powf(scaling_power as f64)).exp();
            (geometric / mix) as f32
        })
        .collect()
}

/// NTK-mixed rotary encoder with a lazily built frequency table.
#[derive(Debug)]
pub struct NtkMixedRotary {
    params: NtkMixedParams,
    // (dim the table was built for, the table itself)
    inv_freq: Mutex<Option<(usize, Arc<Vec<f32>>)>>,
}

impl NtkMixedRotary {
    pub fn new(params: NtkMixedParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            inv_freq: Mutex::new(None),
        })
    }

    pub fn params(&self) -> &NtkMixedParams {
        &self.params
    }

    /// Returns the cached spectrum for `dim`, rebuilding it when the
    /// dimension changed since the last call.
    pub fn inv_freq(&self, dim: usize) -> Arc<Vec<f32>> {
        let mut guard = self.inv_freq.lock().expect("ntk inv_freq lock poisoned");
        match guard.as_ref() {
            Some((cached_dim, table)) if *cached_dim == dim => Arc::clone(table),
            _ => {
                log::debug!("rebuilding ntk-mixed inverse frequencies for dim {dim}");
                let table = Arc::new(ntk_mixed_inv_freq(
                    dim,
                    self.params.freq_base,
                    self.params.scaling_factor,
                    self.params.scaling_power,
                ));
                *guard = Some((dim, Arc::clone(&table)));
                table
            }
        }
    }

    /// Rotates `input` (`[seq, heads, head_dim]`) with the mixed spectrum.
    pub fn apply(&self, input: &Tensor, positions: &Positions) -> Result<Tensor> {
        let (seq, _heads, head_dim) = input.dims3()?;
        if seq != positions.len() {
            bail!(
                "sequence length {seq} does not match position range of {}",
                positions.len()
            );
        }
        if head_dim != self.params.head_dim {
            bail!(
                "input head_dim {head_dim} does not match configured {}",
                self.params.head_dim
            );
        }

        let inv_freq = self.inv_freq(self.params.rope_dim);
        let (sin, cos) = sin_cos_tables(
            &format!(
                "ntk;base={:.6};dim={};k={:.6};b={:.6}",
                self.params.freq_base,
                self.params.rope_dim,
                self.params.scaling_factor,
                self.params.scaling_power
            ),
            positions.end(),
            &inv_freq,
            self.params.freq_scale,
            self.params.attn_factor,
            input.device(),
        )?;
        let sin = sin.narrow(0, positions.start(), seq)?;
        let cos = cos.narrow(0, positions.start(), seq)?;

        rotate_block(input, &sin, &cos, 0, self.params.rope_dim, self.params.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn spectrum_matches_closed_form() {
        let dim = 8;
        let (base, k, b) = (10_000.0f32, 16.0f32, 0.3f32);
        let spectrum = ntk_mixed_inv_freq(dim, base, k, b);
        assert_eq!(spectrum.len(), 4);

        let a = (k as f64).ln() / (4.0f64).powf(b as f64);
        for (j, &value) in spectrum.iter().enumerate() {
            let geometric = (base as f64).powf(-((2 * j) as f64) / dim as f64);
            let expected = geometric / (a * ((j + 1) as f64).powf(b as f64)).exp();
            assert!((value as f64 - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn spectrum_lies_below_geometric() {
        // With k > 1 every mixed frequency is damped relative to classic rope.
        let dim = 16;
        let spectrum = ntk_mixed_inv_freq(dim, 10_000.0, 8.0, 0.5);
        for (j, &value) in spectrum.iter().enumerate() {
            let geometric = 10_000.0f64.powf(-((2 * j) as f64) / dim as f64) as f32;
            assert!(value < geometric);
        }
    }

    #[test]
    fn inv_freq_rebuilds_on_dim_change() {
        let encoder =
            NtkMixedRotary::new(NtkMixedParams::new(8, 8, 16.0, 0.3)).unwrap();
        let first = encoder.inv_freq(8);
        let again = encoder.inv_freq(8);
        assert!(Arc::ptr_eq(&first, &again));

        let resized = encoder.inv_freq(4);
        assert_eq!(resized.len(), 2);
        assert!(!Arc::ptr_eq(&first, &resized));
    }

    #[test]
    fn apply_rotates_pairs_like_classic_rotary() -> Result<()> {
        let device = Device::Cpu;
        let params = NtkMixedParams::new(4, 4, 16.0, 0.3);
        let encoder = NtkMixedRotary::new(params)?;

        let data = [1.0f32, 0.0, 0.0, 1.0];
        let input = Tensor::from_slice(&data, (1, 1, 4), &device)?;
        let positions = Positions::contiguous(5, 1)?;
        let output = encoder.apply(&input, &positions)?.flatten_all()?.to_vec1::<f32>()?;

        let spectrum = ntk_mixed_inv_freq(4, params.freq_base, 16.0, 0.3);
        let angle0 = 5.0 * spectrum[0] as f64;
        let angle1 = 5.0 * spectrum[1] as f64;
        // Pair (0,1) starts at (1,0): rotates to (cos, sin).
        assert!((output[0] as f64 - angle0.cos()).abs() < 1e-5);
        assert!((output[1] as f64 - angle0.sin()).abs() < 1e-5);
        // Pair (2,3) starts at (0,1): rotates to (-sin, cos).
        assert!((output[2] as f64 + angle1.sin()).abs() < 1e-5);
        assert!((output[3] as f64 - angle1.cos()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn validate_rejects_zero_rope_dim() {
        assert!(NtkMixedParams::new(8, 0, 16.0, 0.3).validate().is_err());
        assert!(NtkMixedParams::new(4, 8, 16.0, 0.3).validate().is_err());
        assert!(NtkMixedParams::new(8, 8, 0.0, 0.3).validate().is_err());
    }
}
