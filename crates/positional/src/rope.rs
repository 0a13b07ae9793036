//! Rotary position embedding.
//!
//! Pairs of feature dimensions are rotated by `freq_scale * position *
//! base^(-2i/rope_dim)`. Two pairing layouts exist in the wild:
//! [`RotaryLayout::Interleaved`] pairs `(2i, 2i+1)` while
//! [`RotaryLayout::SplitHalf`] pairs `(i, i + rope_dim/2)` (the NEOX
//! convention). Rotation may cover only a leading block of the head
//! (`rope_dim < head_dim`) and some architectures skip a block of leading
//! dimensions before the rotated window starts.
//!
//! Sine/cosine tables are f32, shaped `[len, rope_dim/2]`, and shared across
//! layers through a bounded process-wide cache keyed by geometry, frequency
//! parameters, and device.

use candle_core::{bail, DType, Device, DeviceLocation, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};

use crate::positions::Positions;

const SIN_COS_CACHE_CAPACITY: usize = 16;

/// Identity of one sine/cosine table pair. Float parameters are compared
/// bit-exact; tables for "close" parameters are distinct entries.
#[derive(Clone, PartialEq, Eq, Hash)]
struct TableKey {
    spectrum: String,
    len: usize,
    half: usize,
    freq_scale_bits: u32,
    attn_factor_bits: u32,
    device: String,
}

struct SinCosCache {
    capacity: usize,
    recency: VecDeque<TableKey>,
    tables: HashMap<TableKey, (Tensor, Tensor)>,
}

impl SinCosCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recency: VecDeque::with_capacity(capacity),
            tables: HashMap::with_capacity(capacity),
        }
    }

    fn mark_used(&mut self, key: &TableKey) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key.clone());
    }

    fn lookup(&mut self, key: &TableKey) -> Option<(Tensor, Tensor)> {
        let tables = self.tables.get(key)?.clone();
        self.mark_used(key);
        Some(tables)
    }

    fn store(&mut self, key: TableKey, tables: (Tensor, Tensor)) {
        let fresh = self.tables.insert(key.clone(), tables).is_none();
        if fresh && self.tables.len() > self.capacity {
            if let Some(oldest) = self.recency.pop_front() {
                self.tables.remove(&oldest);
            }
        }
        self.mark_used(&key);
    }
}

fn global_sin_cos_cache() -> &'static Mutex<SinCosCache> {
    static CACHE: OnceLock<Mutex<SinCosCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(SinCosCache::new(SIN_COS_CACHE_CAPACITY)))
}

fn device_id(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_owned(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
    }
}

/// Retrieves (or lazily builds) sine/cosine tables covering positions
/// `[0, len)` for the given inverse-frequency spectrum.
///
/// Angles are `freq_scale * pos * inv_freq[i]`; both tables are scaled by
/// `attn_factor`. `tag` distinguishes spectra that would otherwise collide
/// under the same geometry (classic versus NTK-mixed).
pub(crate) fn sin_cos_tables(
    tag: &str,
    len: usize,
    inv_freq: &[f32],
    freq_scale: f32,
    attn_factor: f32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    if len == 0 {
        bail!("sin/cos table length must be non-zero");
    }
    let half = inv_freq.len();
    let key = TableKey {
        spectrum: tag.to_owned(),
        len,
        half,
        freq_scale_bits: freq_scale.to_bits(),
        attn_factor_bits: attn_factor.to_bits(),
        device: device_id(device),
    };

    let cache = global_sin_cos_cache();
    {
        let mut guard = cache.lock().expect("sin/cos cache lock poisoned");
        if let Some((sin, cos)) = guard.lookup(&key) {
            log::trace!("sin/cos cache hit: {tag} len={len}");
            return Ok((sin, cos));
        }
        log::debug!("sin/cos cache miss: {tag} len={len}");
    }

    let mut sin_data = Vec::with_capacity(len * half);
    let mut cos_data = Vec::with_capacity(len * half);
    for pos in 0..len {
        let pos_f = pos as f64 * freq_scale as f64;
        for &freq in inv_freq {
            let angle = pos_f * freq as f64;
            sin_data.push((angle.sin() * attn_factor as f64) as f32);
            cos_data.push((angle.cos() * attn_factor as f64) as f32);
        }
    }

    let sin = Tensor::from_vec(sin_data, (len, half), device)?;
    let cos = Tensor::from_vec(cos_data, (len, half), device)?;

    let mut guard = cache.lock().expect("sin/cos cache lock poisoned");
    if let Some(cached) = guard.lookup(&key) {
        return Ok(cached);
    }
    guard.store(key, (sin.clone(), cos.clone()));
    Ok((sin, cos))
}

/// Feature-pairing convention for the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotaryLayout {
    /// Adjacent pairs `(2i, 2i+1)`.
    Interleaved,
    /// First-half/second-half pairs `(i, i + rope_dim/2)`.
    SplitHalf,
}

/// Parameters of the classic rotary encoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotaryParams {
    pub head_dim: usize,
    /// Number of dimensions rotated; `0` disables rotation entirely.
    pub rope_dim: usize,
    pub freq_base: f32,
    pub freq_scale: f32,
    pub attn_factor: f32,
    pub layout: RotaryLayout,
    /// Leading dimensions left untouched before the rotated window starts.
    pub skip_dims: usize,
}

impl RotaryParams {
    pub fn new(head_dim: usize, rope_dim: usize, layout: RotaryLayout) -> Self {
        Self {
            head_dim,
            rope_dim,
            freq_base: 10_000.0,
            freq_scale: 1.0,
            attn_factor: 1.0,
            layout,
            skip_dims: 0,
        }
    }

    pub fn with_freq_base(mut self, freq_base: f32) -> Self {
        self.freq_base = freq_base;
        self
    }

    pub fn with_freq_scale(mut self, freq_scale: f32) -> Self {
        self.freq_scale = freq_scale;
        self
    }

    pub fn with_attn_factor(mut self, attn_factor: f32) -> Self {
        self.attn_factor = attn_factor;
        self
    }

    pub fn with_skip_dims(mut self, skip_dims: usize) -> Self {
        self.skip_dims = skip_dims;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        if self.rope_dim % 2 != 0 {
            bail!("rope_dim must be even, got {}", self.rope_dim);
        }
        if self.skip_dims + self.rope_dim > self.head_dim {
            bail!(
                "rotated window [{}..{}) exceeds head_dim {}",
                self.skip_dims,
                self.skip_dims + self.rope_dim,
                self.head_dim
            );
        }
        if !(self.freq_base > 0.0) {
            bail!("freq_base must be positive, got {}", self.freq_base);
        }
        if !(self.freq_scale > 0.0) {
            bail!("freq_scale must be positive, got {}", self.freq_scale);
        }
        Ok(())
    }

    /// The geometric inverse-frequency spectrum `base^(-2i/rope_dim)`.
    pub fn inv_freq(&self) -> Vec<f32> {
        let half = self.rope_dim / 2;
        let base = self.freq_base as f64;
        (0..half)
            .map(|i| base.powf(-((2 * i) as f64) / self.rope_dim as f64) as f32)
            .collect()
    }
}

/// Rotates `input` (`[seq, heads, head_dim]`) according to `params`.
///
/// Returns the input unchanged when `rope_dim == 0`.
pub fn apply_rotary(input: &Tensor, positions: &Positions, params: &RotaryParams) -> Result<Tensor> {
    params.validate()?;
    if params.rope_dim == 0 {
        return Ok(input.clone());
    }
    let (seq, _heads, head_dim) = input.dims3()?;
    if seq != positions.len() {
        bail!(
            "sequence length {seq} does not match position range of {}",
            positions.len()
        );
    }
    if head_dim != params.head_dim {
        bail!(
            "input head_dim {head_dim} does not match configured {}",
            params.head_dim
        );
    }

    let inv_freq = params.inv_freq();
    let (sin, cos) = sin_cos_tables(
        &format!("rotary;base={:.6};dim={}", params.freq_base, params.rope_dim),
        positions.end(),
        &inv_freq,
        params.freq_scale,
        params.attn_factor,
        input.device(),
    )?;
    let sin = sin.narrow(0, positions.start(), seq)?;
    let cos = cos.narrow(0, positions.start(), seq)?;

    rotate_block(
        input,
        &sin,
        &cos,
        params.skip_dims,
        params.rope_dim,
        params.layout,
    )
}

/// Applies the rotation to the window `[skip, skip + rope_dim)` of the last
/// dimension, leaving the rest of the head untouched.
///
/// `sin`/`cos` are `[seq, rope_dim/2]` f32 tables already narrowed to the
/// positions being processed. The rotation runs in f32 and the result is
/// cast back to the input dtype.
pub(crate) fn rotate_block(
    input: &Tensor,
    sin: &Tensor,
    cos: &Tensor,
    skip: usize,
    rope_dim: usize,
    layout: RotaryLayout,
) -> Result<Tensor> {
    let (seq, heads, head_dim) = input.dims3()?;
    let half = rope_dim / 2;
    let dtype = input.dtype();

    let sin_b = sin.reshape((seq, 1, half))?;
    let cos_b = cos.reshape((seq, 1, half))?;

    let block = input
        .narrow(2, skip, rope_dim)?
        .contiguous()?
        .to_dtype(DType::F32)?;

    let rotated = match layout {
        RotaryLayout::Interleaved => {
            let pairs = block.reshape((seq, heads, half, 2))?;
            let chunks = pairs.chunk(2, 3)?;
            let even = chunks[0].squeeze(3)?;
            let odd = chunks[1].squeeze(3)?;

            let rot_even = even
                .broadcast_mul(&cos_b)?
                .sub(&odd.broadcast_mul(&sin_b)?)?;
            let rot_odd = odd
                .broadcast_mul(&cos_b)?
                .add(&even.broadcast_mul(&sin_b)?)?;

            Tensor::cat(&[&rot_even.unsqueeze(3)?, &rot_odd.unsqueeze(3)?], 3)?
                .reshape((seq, heads, rope_dim))?
        }
        RotaryLayout::SplitHalf => {
            let lo = block.narrow(2, 0, half)?;
            let hi = block.narrow(2, half, half)?;

            let rot_lo = lo.broadcast_mul(&cos_b)?.sub(&hi.broadcast_mul(&sin_b)?)?;
            let rot_hi = hi.broadcast_mul(&cos_b)?.add(&lo.broadcast_mul(&sin_b)?)?;

            Tensor::cat(&[&rot_lo, &rot_hi], 2)?
        }
    };
    let rotated = rotated.to_dtype(dtype)?;

    let tail = head_dim - skip - rope_dim;
    if skip == 0 && tail == 0 {
        return Ok(rotated);
    }
    let mut parts = Vec::with_capacity(3);
    if skip > 0 {
        parts.push(input.narrow(2, 0, skip)?);
    }
    parts.push(rotated);
    if tail > 0 {
        parts.push(input.narrow(2, skip + rope_dim, tail)?);
    }
    let refs: Vec<&Tensor> = parts.iter().collect();
    Tensor::cat(&refs, 2)
}
