//! Builders for causal masks over the cached key range.

use candle_core::{bail, Device, Result, Tensor};

/// Causal mask for `qlen` queries starting at absolute position `n_past`
/// over keys `[0, klen)`.
///
/// Query row `i` may attend key columns `j <= n_past + i`; later columns
/// get `-inf`.
pub fn build_causal_mask(
    device: &Device,
    qlen: usize,
    n_past: usize,
    klen: usize,
) -> Result<Tensor> {
    if klen < n_past + qlen {
        bail!(
            "key range {klen} shorter than n_past {n_past} + qlen {qlen}"
        );
    }
    let mut data = vec![0f32; qlen * klen];
    for i in 0..qlen {
        let row_start = i * klen;
        let max_k = n_past + i;
        for j in (max_k + 1)..klen {
            data[row_start + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (qlen, klen), device)
}

/// First-pass variant used when `n_past == 0`: each row's forbidden suffix
/// is written as one bulk fill. Behaviorally identical to
/// [`build_causal_mask`] with `n_past == 0`.
pub fn build_first_pass_mask(device: &Device, qlen: usize, klen: usize) -> Result<Tensor> {
    if klen < qlen {
        bail!("key range {klen} shorter than qlen {qlen}");
    }
    let mut data = vec![0f32; qlen * klen];
    for i in 0..qlen {
        let row_start = i * klen;
        data[row_start + i + 1..row_start + klen].fill(f32::NEG_INFINITY);
    }
    Tensor::from_vec(data, (qlen, klen), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_future_positions_only() -> Result<()> {
        let mask = build_causal_mask(&Device::Cpu, 2, 3, 5)?;
        let rows = mask.to_vec2::<f32>()?;
        // Query 0 sits at absolute position 3.
        assert_eq!(rows[0][..4], [0.0, 0.0, 0.0, 0.0]);
        assert_eq!(rows[0][4], f32::NEG_INFINITY);
        // Query 1 sits at position 4 and sees everything.
        assert!(rows[1].iter().all(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn first_pass_matches_standard_causal() -> Result<()> {
        let device = Device::Cpu;
        let bulk = build_first_pass_mask(&device, 4, 4)?.to_vec2::<f32>()?;
        let standard = build_causal_mask(&device, 4, 0, 4)?.to_vec2::<f32>()?;
        assert_eq!(bulk, standard);
        Ok(())
    }

    #[test]
    fn masks_carry_the_shared_dtype() -> Result<()> {
        let device = Device::Cpu;
        let causal = build_causal_mask(&device, 2, 1, 3)?;
        let first_pass = build_first_pass_mask(&device, 2, 2)?;
        assert_eq!(causal.dtype(), crate::masks::MASK_DTYPE);
        assert_eq!(first_pass.dtype(), crate::masks::MASK_DTYPE);
        Ok(())
    }

    #[test]
    fn rejects_short_key_ranges() {
        assert!(build_causal_mask(&Device::Cpu, 3, 2, 4).is_err());
        assert!(build_first_pass_mask(&Device::Cpu, 3, 2).is_err());
    }
}
