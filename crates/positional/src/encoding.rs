//! Positional encoding strategy selection.
//!
//! Every supported scheme fits one of two hooks: a query/key transform
//! applied before scores are computed (rotary variants) or an additive bias
//! applied to the raw scores (ALiBi). [`PositionalEncoding`] is the closed
//! set of variants an attention layer is constructed with; the layer calls
//! both hooks unconditionally and variants that do not participate return
//! their input unchanged.

use candle_core::{Device, Result, Tensor};

use crate::alibi::{build_alibi_bias, AlibiParams};
use crate::ntk::{NtkMixedParams, NtkMixedRotary};
use crate::positions::Positions;
use crate::rope::{apply_rotary, RotaryParams};

/// The closed set of positional encoding schemes.
#[derive(Debug)]
pub enum PositionalEncoding {
    /// No positional information injected here (absolute embeddings or none).
    Identity,
    /// Classic rotary applied to queries and keys.
    Rotary(RotaryParams),
    /// NTK-mixed rotary applied to queries and keys.
    NtkMixed(NtkMixedRotary),
    /// Additive score bias; queries and keys pass through untouched.
    Alibi(AlibiParams),
}

impl PositionalEncoding {
    /// Builds a rotary variant, degenerating to [`Self::Identity`] when
    /// `rope_dim` is zero.
    pub fn rotary(params: RotaryParams) -> Result<Self> {
        params.validate()?;
        if params.rope_dim == 0 {
            return Ok(Self::Identity);
        }
        Ok(Self::Rotary(params))
    }

    pub fn ntk_mixed(params: NtkMixedParams) -> Result<Self> {
        Ok(Self::NtkMixed(NtkMixedRotary::new(params)?))
    }

    pub fn alibi(params: AlibiParams) -> Result<Self> {
        params.validate()?;
        Ok(Self::Alibi(params))
    }

    /// Transforms the query tensor (`[seq, heads, head_dim]`).
    pub fn encode_query(&self, query: &Tensor, positions: &Positions) -> Result<Tensor> {
        match self {
            Self::Identity | Self::Alibi(_) => Ok(query.clone()),
            Self::Rotary(params) => apply_rotary(query, positions, params),
            Self::NtkMixed(encoder) => encoder.apply(query, positions),
        }
    }

    /// Transforms the key tensor (`[seq, kv_heads, head_dim]`).
    pub fn encode_key(&self, key: &Tensor, positions: &Positions) -> Result<Tensor> {
        match self {
            Self::Identity | Self::Alibi(_) => Ok(key.clone()),
            Self::Rotary(params) => apply_rotary(key, positions, params),
            Self::NtkMixed(encoder) => encoder.apply(key, positions),
        }
    }

    /// Returns the additive score bias `[heads, qlen, klen]`, or `None` for
    /// variants that encode position through the query/key transform.
    pub fn score_bias(
        &self,
        qlen: usize,
        n_past: usize,
        klen: usize,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        match self {
            Self::Alibi(params) => {
                build_alibi_bias(params, qlen, n_past, klen, device).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Short tag for logs.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Rotary(_) => "rotary",
            Self::NtkMixed(_) => "ntk-mixed",
            Self::Alibi(_) => "alibi",
        }
    }
}
