//! Graph adapters over the projection and positional-encoding layers.
//!
//! The attention core assembles its forward pass out of [`GraphOp`] nodes;
//! these adapters wrap the `layers` and `positional` crates so their
//! building blocks can be queued like any other operation.

use std::sync::Arc;

use candle_core::{Result as TensorResult, Tensor};
use layers::{Linear, PrecisionPolicy};
use positional::{PositionalEncoding, Positions};

use crate::graph::GraphOp;

/// Dense projection as a graph node.
pub struct ProjectionOp {
    name: &'static str,
    linear: Arc<Linear>,
    policy: PrecisionPolicy,
}

impl ProjectionOp {
    pub fn new(name: &'static str, linear: Arc<Linear>, policy: PrecisionPolicy) -> Arc<dyn GraphOp> {
        Arc::new(Self {
            name,
            linear,
            policy,
        })
    }
}

impl GraphOp for ProjectionOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, inputs: &[Tensor]) -> TensorResult<Tensor> {
        self.linear.forward(&inputs[0], &self.policy)
    }
}

/// Positional transform of the query tensor (`[qlen, heads, head_dim]`).
pub struct EncodeQueryOp {
    encoding: Arc<PositionalEncoding>,
    positions: Positions,
}

impl EncodeQueryOp {
    pub fn new(encoding: Arc<PositionalEncoding>, positions: Positions) -> Arc<dyn GraphOp> {
        Arc::new(Self {
            encoding,
            positions,
        })
    }
}

impl GraphOp for EncodeQueryOp {
    fn name(&self) -> &'static str {
        "encode_query"
    }

    fn run(&self, inputs: &[Tensor]) -> TensorResult<Tensor> {
        self.encoding.encode_query(&inputs[0], &self.positions)
    }
}

/// Positional transform of the key tensor (`[qlen, kv_heads, head_dim]`).
pub struct EncodeKeyOp {
    encoding: Arc<PositionalEncoding>,
    positions: Positions,
}

impl EncodeKeyOp {
    pub fn new(encoding: Arc<PositionalEncoding>, positions: Positions) -> Arc<dyn GraphOp> {
        Arc::new(Self {
            encoding,
            positions,
        })
    }
}

impl GraphOp for EncodeKeyOp {
    fn name(&self) -> &'static str {
        "encode_key"
    }

    fn run(&self, inputs: &[Tensor]) -> TensorResult<Tensor> {
        self.encoding.encode_key(&inputs[0], &self.positions)
    }
}

/// Additive positional score bias (`[heads, qlen, klen]` scores input).
///
/// Variants without a score transform pass the scores through untouched.
pub struct ScoreBiasOp {
    encoding: Arc<PositionalEncoding>,
    qlen: usize,
    n_past: usize,
    klen: usize,
}

impl ScoreBiasOp {
    pub fn new(
        encoding: Arc<PositionalEncoding>,
        qlen: usize,
        n_past: usize,
        klen: usize,
    ) -> Arc<dyn GraphOp> {
        Arc::new(Self {
            encoding,
            qlen,
            n_past,
            klen,
        })
    }
}

impl GraphOp for ScoreBiasOp {
    fn name(&self) -> &'static str {
        "score_bias"
    }

    fn run(&self, inputs: &[Tensor]) -> TensorResult<Tensor> {
        let scores = &inputs[0];
        match self
            .encoding
            .score_bias(self.qlen, self.n_past, self.klen, scores.device())?
        {
            Some(bias) => scores.broadcast_add(&bias.to_dtype(scores.dtype())?),
            None => Ok(scores.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use layers::LinearConfig;
    use positional::AlibiParams;

    #[test]
    fn projection_op_runs_the_wrapped_linear() -> TensorResult<()> {
        let device = Device::Cpu;
        let weight = Tensor::from_slice(&[1.0f32, 1.0], (1, 2), &device)?;
        let linear = Arc::new(Linear::new(LinearConfig::new(2, 1), weight, None)?);
        let op = ProjectionOp::new(
            "project_test",
            linear,
            PrecisionPolicy::from_parameter_dtype(DType::F32),
        );

        let input = Tensor::from_slice(&[2.0f32, 3.0], (1, 2), &device)?;
        let output = op.run(&[input])?;
        assert_eq!(output.to_vec2::<f32>()?, vec![vec![5.0]]);
        Ok(())
    }

    #[test]
    fn score_bias_op_applies_alibi() -> TensorResult<()> {
        let device = Device::Cpu;
        let encoding = Arc::new(PositionalEncoding::alibi(AlibiParams::new(2)).unwrap());
        let op = ScoreBiasOp::new(encoding, 1, 0, 1);

        let scores = Tensor::zeros((2, 1, 1), DType::F32, &device)?;
        let biased = op.run(&[scores])?;
        // Distance zero: the bias is zero for every head.
        assert_eq!(
            biased.flatten_all()?.to_vec1::<f32>()?,
            vec![0.0, 0.0]
        );
        Ok(())
    }

    #[test]
    fn score_bias_op_passes_rotary_through() -> TensorResult<()> {
        use positional::{RotaryLayout, RotaryParams};
        let device = Device::Cpu;
        let encoding = Arc::new(
            PositionalEncoding::rotary(RotaryParams::new(4, 4, RotaryLayout::Interleaved)).unwrap(),
        );
        let op = ScoreBiasOp::new(encoding, 2, 0, 2);
        let scores = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], (1, 2, 2), &device)?;
        let output = op.run(&[scores.clone()])?;
        let diff = output.sub(&scores)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
