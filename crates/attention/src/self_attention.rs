//! The per-layer attention core.
//!
//! [`SelfAttention`] orchestrates one forward pass: resolve any pending
//! cache shift, project the hidden state, apply the positional encoding,
//! write the fresh keys/values into the cache, read the full valid range
//! back, compute masked grouped-query attention, and project the context
//! back to hidden size. All tensor work is queued on a [`TensorGraph`] and
//! executed once; queue order is what keeps cache writes ahead of cache
//! reads.
//!
//! Keys enter the cache already rotated. A later shift therefore moves
//! rotated keys without re-rotating them; retained tokens keep the absolute
//! positions they were written with.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use layers::{Linear, PrecisionPolicy};
use positional::{PositionalEncoding, Positions};

use crate::core::{AttentionConfig, AttentionError, Result};
use crate::graph::TensorGraph;
use crate::interop::{EncodeKeyOp, EncodeQueryOp, ProjectionOp, ScoreBiasOp};
use crate::kv_cache::{compact_buffers, KvCache};
use crate::masks::{build_causal_mask, build_first_pass_mask};

/// The four dense projections owned by one attention layer.
pub struct ProjectionSet {
    pub query: Linear,
    pub key: Linear,
    pub value: Linear,
    pub output: Linear,
}

/// One attention layer instance with its private KV cache.
pub struct SelfAttention {
    config: AttentionConfig,
    encoding: Arc<PositionalEncoding>,
    query_proj: Arc<Linear>,
    key_proj: Arc<Linear>,
    value_proj: Arc<Linear>,
    output_proj: Arc<Linear>,
    cache: KvCache,
}

impl SelfAttention {
    /// Validates the configuration, the projection geometry, and the
    /// encoding parameters, then allocates the cache. Construction fails
    /// rather than producing silently wrong shapes.
    pub fn new(
        config: AttentionConfig,
        encoding: PositionalEncoding,
        projections: ProjectionSet,
    ) -> Result<Self> {
        config.validate()?;

        let hidden = config.hidden_size();
        let kv_hidden = config.kv_hidden_size();
        expect_projection("query projection", &projections.query, hidden, hidden)?;
        expect_projection("key projection", &projections.key, hidden, kv_hidden)?;
        expect_projection("value projection", &projections.value, hidden, kv_hidden)?;
        expect_projection("output projection", &projections.output, hidden, hidden)?;
        expect_encoding_fits(&config, &encoding)?;

        let dtype = projections.query.weight().dtype();
        let device = projections.query.weight().device().clone();
        let cache = KvCache::new(config.cache_capacity, kv_hidden, dtype, &device)?;

        log::info!(
            "attention layer: {} heads / {} kv heads, head_dim {}, encoding {}, capacity {}",
            config.head_count,
            config.kv_head_count,
            config.head_dim,
            encoding.summary(),
            config.cache_capacity
        );

        Ok(Self {
            config,
            encoding: Arc::new(encoding),
            query_proj: Arc::new(projections.query),
            key_proj: Arc::new(projections.key),
            value_proj: Arc::new(projections.value),
            output_proj: Arc::new(projections.output),
            cache,
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Stages a sliding-window eviction; takes effect at the start of the
    /// next [`SelfAttention::forward`] call.
    pub fn request_shift(&mut self, discard: usize, total: usize) -> Result<()> {
        self.cache.request_shift(discard, total)
    }

    /// Logically empties the cache for a new session.
    pub fn reset(&mut self) {
        self.cache.reset();
    }

    /// Runs one forward pass over `hidden` (`[qlen, hidden_size]`) starting
    /// at absolute position `n_past`.
    pub fn forward(&mut self, hidden: &Tensor, n_past: usize) -> Result<Tensor> {
        let (qlen, width) = hidden.dims2().map_err(|_| {
            AttentionError::shape(
                "forward input",
                format!("expected (qlen, hidden), got {:?}", hidden.dims()),
            )
        })?;
        if width != self.config.hidden_size() {
            return Err(AttentionError::shape(
                "forward input",
                format!(
                    "hidden width {width} does not match configured {}",
                    self.config.hidden_size()
                ),
            ));
        }
        if qlen == 0 {
            return Err(AttentionError::shape("forward input", "qlen must be non-zero"));
        }

        // Offsets are validated against the post-shift occupancy, but the
        // staged shift itself is only consumed once the call can no longer
        // fail: an errored forward leaves the pending state intact.
        let cached_len = match self.cache.pending_shift() {
            Some((_, remain)) => remain,
            None => self.cache.valid_len(),
        };
        if n_past > cached_len {
            return Err(AttentionError::shape(
                "forward offset",
                format!("n_past {n_past} beyond cached length {cached_len}"),
            ));
        }
        if n_past + qlen > self.cache.capacity() {
            return Err(AttentionError::CapacityExceeded {
                position: n_past,
                qlen,
                capacity: self.cache.capacity(),
            });
        }

        let mut graph = TensorGraph::new();
        let source = graph.leaf(hidden.clone());

        // The staged shift resolves first; its block move is queued ahead of
        // this pass's cache writes.
        if let Some((discard, remain)) = self.cache.take_pending_shift() {
            let (keys, values) = self.cache.buffers();
            graph.apply_fn("compact_cache", &[], move |_| {
                compact_buffers(&keys, &values, discard, remain)?;
                Ok(keys.snapshot())
            });
            self.cache.note_compacted(remain);
            log::debug!("shift resolved: discarded {discard}, retaining {remain}");
        }

        let positions = Positions::contiguous(n_past, qlen)?;
        let device = hidden.device();
        let dtype = hidden.dtype();
        let attn_policy = self.config.precision_policy(dtype);
        let proj_policy = PrecisionPolicy::new(dtype, dtype, DType::F32);
        let compute = attn_policy.compute();

        let head_count = self.config.head_count;
        let kv_heads = self.config.kv_head_count;
        let head_dim = self.config.head_dim;
        let kv_hidden = self.config.kv_hidden_size();
        let group = self.config.group_size();
        let needed = n_past + qlen;

        let q = graph.apply(
            ProjectionOp::new("project_query", Arc::clone(&self.query_proj), proj_policy),
            &[source],
        );
        let k = graph.apply(
            ProjectionOp::new("project_key", Arc::clone(&self.key_proj), proj_policy),
            &[source],
        );
        let v = graph.apply(
            ProjectionOp::new("project_value", Arc::clone(&self.value_proj), proj_policy),
            &[source],
        );

        let q_heads = graph.apply_fn("split_query_heads", &[q], move |i| {
            i[0].reshape((qlen, head_count, head_dim))
        });
        let k_heads = graph.apply_fn("split_key_heads", &[k], move |i| {
            i[0].reshape((qlen, kv_heads, head_dim))
        });

        let q_enc = graph.apply(
            EncodeQueryOp::new(Arc::clone(&self.encoding), positions),
            &[q_heads],
        );
        let k_enc = graph.apply(
            EncodeKeyOp::new(Arc::clone(&self.encoding), positions),
            &[k_heads],
        );

        // Keys are cached post-rotation; values are cached feature-major.
        let (keys_buf, values_buf) = self.cache.buffers();
        let k_flat = graph.apply_fn("flatten_key", &[k_enc], move |i| {
            i[0].reshape((qlen, kv_hidden))?.contiguous()
        });
        let keys_writer = keys_buf.clone();
        let write_k = graph.apply_fn("write_key_cache", &[k_flat], move |i| {
            keys_writer.snapshot().slice_set(&i[0], 0, n_past)?;
            Ok(i[0].clone())
        });
        let v_t = graph.apply_fn("transpose_value", &[v], |i| i[0].t()?.contiguous());
        let values_writer = values_buf.clone();
        let write_v = graph.apply_fn("write_value_cache", &[v_t], move |i| {
            values_writer.snapshot().slice_set(&i[0], 1, n_past)?;
            Ok(i[0].clone())
        });

        // Reads cover the full valid range [0, n_past + qlen); the explicit
        // dependency on the write node keeps the ordering visible.
        let keys_reader = keys_buf;
        let k_all = graph.apply_fn("read_key_cache", &[write_k], move |_| {
            keys_reader.snapshot().narrow(0, 0, needed)?.contiguous()
        });
        let values_reader = values_buf;
        let v_all = graph.apply_fn("read_value_cache", &[write_v], move |_| {
            values_reader.snapshot().narrow(1, 0, needed)?.contiguous()
        });

        // Grouped-query scores: each group of query heads broadcasts over
        // one kv head, no duplication of cached data.
        let q4 = graph.apply_fn("group_query_heads", &[q_enc], move |i| {
            i[0].transpose(0, 1)?
                .reshape((kv_heads, group, qlen, head_dim))?
                .to_dtype(compute)
        });
        let k4 = graph.apply_fn("group_key_heads", &[k_all], move |i| {
            i[0].reshape((needed, kv_heads, head_dim))?
                .transpose(0, 1)?
                .unsqueeze(1)?
                .transpose(2, 3)?
                .contiguous()?
                .to_dtype(compute)
        });
        let scores = graph.apply_fn("attention_scores", &[q4, k4], |i| {
            i[0].broadcast_matmul(&i[1])
        });

        let scaled = if self.config.scaling_enabled {
            let scale = 1.0 / (head_dim as f64).sqrt();
            graph.apply_fn("scale_scores", &[scores], move |i| i[0].affine(scale, 0.0))
        } else {
            scores
        };

        let flat_scores = graph.apply_fn("merge_head_groups", &[scaled], move |i| {
            i[0].reshape((head_count, qlen, needed))
        });
        let biased = graph.apply(
            ScoreBiasOp::new(Arc::clone(&self.encoding), qlen, n_past, needed),
            &[flat_scores],
        );

        let mask = if n_past == 0 {
            build_first_pass_mask(device, qlen, needed)?
        } else {
            build_causal_mask(device, qlen, n_past, needed)?
        };
        let mask_node = graph.leaf(mask.to_dtype(compute)?.unsqueeze(0)?);
        let masked = graph.apply_fn("apply_causal_mask", &[biased, mask_node], |i| {
            i[0].broadcast_add(&i[1])
        });
        let weights = graph.apply_fn("softmax", &[masked], |i| {
            candle_nn::ops::softmax_last_dim(&i[0])
        });

        let w4 = graph.apply_fn("split_head_groups", &[weights], move |i| {
            i[0].reshape((kv_heads, group, qlen, needed))
        });
        let v4 = graph.apply_fn("group_value_heads", &[v_all], move |i| {
            i[0].reshape((kv_heads, head_dim, needed))?
                .transpose(1, 2)?
                .unsqueeze(1)?
                .contiguous()?
                .to_dtype(compute)
        });
        let context = graph.apply_fn("weighted_sum", &[w4, v4], |i| {
            i[0].broadcast_matmul(&i[1])
        });
        let merged = graph.apply_fn("merge_context", &[context], move |i| {
            i[0].reshape((head_count, qlen, head_dim))?
                .transpose(0, 1)?
                .reshape((qlen, head_count * head_dim))
        });
        let stored = graph.apply_fn("restore_dtype", &[merged], move |i| i[0].to_dtype(dtype));
        let output = graph.apply(
            ProjectionOp::new("project_output", Arc::clone(&self.output_proj), proj_policy),
            &[stored],
        );

        let result = graph.execute(output)?;
        self.cache.set_valid_len(needed);
        Ok(result)
    }
}

fn expect_projection(
    context: &'static str,
    linear: &Linear,
    input_dim: usize,
    output_dim: usize,
) -> Result<()> {
    let config = linear.config();
    if config.input_dim != input_dim || config.output_dim != output_dim {
        return Err(AttentionError::shape(
            context,
            format!(
                "expected ({input_dim} -> {output_dim}), got ({} -> {})",
                config.input_dim, config.output_dim
            ),
        ));
    }
    Ok(())
}

fn expect_encoding_fits(config: &AttentionConfig, encoding: &PositionalEncoding) -> Result<()> {
    match encoding {
        PositionalEncoding::Identity => Ok(()),
        PositionalEncoding::Rotary(params) => {
            if params.head_dim != config.head_dim || params.rope_dim != config.rope_dim {
                return Err(AttentionError::config(format!(
                    "rotary geometry ({}, {}) does not match attention ({}, {})",
                    params.head_dim, params.rope_dim, config.head_dim, config.rope_dim
                )));
            }
            Ok(())
        }
        PositionalEncoding::NtkMixed(encoder) => {
            let params = encoder.params();
            if params.head_dim != config.head_dim || params.rope_dim != config.rope_dim {
                return Err(AttentionError::config(format!(
                    "ntk-mixed geometry ({}, {}) does not match attention ({}, {})",
                    params.head_dim, params.rope_dim, config.head_dim, config.rope_dim
                )));
            }
            Ok(())
        }
        PositionalEncoding::Alibi(params) => {
            if params.head_count != config.head_count {
                return Err(AttentionError::config(format!(
                    "alibi head_count {} does not match attention head_count {}",
                    params.head_count, config.head_count
                )));
            }
            Ok(())
        }
    }
}
