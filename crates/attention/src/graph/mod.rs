//! Deferred tensor-graph construction.
//!
//! A forward pass does not evaluate tensor operations eagerly: it queues
//! them on a [`TensorGraph`] and executes the whole queue once. Execution
//! walks the queue in insertion order, which is the correctness mechanism
//! for cache mutation: an operation that writes a [`SharedBuffer`] is
//! queued before the operation that reads it, and no other ordering
//! information exists. Each node may only reference results of nodes queued
//! before it.
//!
//! The graph is scoped to a single forward pass; [`TensorGraph::execute`]
//! drains the queue.

use std::sync::{Arc, Mutex};

use candle_core::{Result as TensorResult, Tensor};

use crate::core::{AttentionError, Result};

/// Handle to a queued operation's result.
pub type NodeId = usize;

/// A single queued tensor operation.
pub trait GraphOp: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Evaluates the operation over its resolved inputs.
    fn run(&self, inputs: &[Tensor]) -> TensorResult<Tensor>;
}

struct ConstOp {
    tensor: Tensor,
}

impl GraphOp for ConstOp {
    fn name(&self) -> &'static str {
        "const"
    }

    fn run(&self, _inputs: &[Tensor]) -> TensorResult<Tensor> {
        Ok(self.tensor.clone())
    }
}

/// Closure-backed [`GraphOp`] for the plain transform steps of a pass.
pub struct FnOp {
    name: &'static str,
    run: Box<dyn Fn(&[Tensor]) -> TensorResult<Tensor> + Send + Sync>,
}

impl FnOp {
    pub fn new(
        name: &'static str,
        run: impl Fn(&[Tensor]) -> TensorResult<Tensor> + Send + Sync + 'static,
    ) -> Arc<dyn GraphOp> {
        Arc::new(Self {
            name,
            run: Box::new(run),
        })
    }
}

impl GraphOp for FnOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, inputs: &[Tensor]) -> TensorResult<Tensor> {
        (self.run)(inputs)
    }
}

/// A tensor slot mutated in place across forward passes.
///
/// Graph operations that write the buffer replace the stored tensor; reads
/// clone the current handle. The mutex makes the handle shareable with the
/// queued closures that mutate it during execution.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Tensor>>,
}

impl SharedBuffer {
    pub fn new(tensor: Tensor) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tensor)),
        }
    }

    /// Clones the current tensor handle.
    pub fn snapshot(&self) -> Tensor {
        self.inner.lock().expect("shared buffer lock poisoned").clone()
    }

    /// Replaces the stored tensor wholesale.
    pub fn replace(&self, tensor: Tensor) {
        *self.inner.lock().expect("shared buffer lock poisoned") = tensor;
    }

    /// Rewrites the stored tensor through `f`.
    pub fn update(&self, f: impl FnOnce(&Tensor) -> TensorResult<Tensor>) -> TensorResult<()> {
        let mut guard = self.inner.lock().expect("shared buffer lock poisoned");
        *guard = f(&guard)?;
        Ok(())
    }
}

struct Node {
    op: Arc<dyn GraphOp>,
    inputs: Vec<NodeId>,
}

/// Queue of tensor operations for one forward pass.
#[derive(Default)]
pub struct TensorGraph {
    nodes: Vec<Node>,
}

impl TensorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Queues a constant input tensor.
    pub fn leaf(&mut self, tensor: Tensor) -> NodeId {
        self.push(Arc::new(ConstOp { tensor }), Vec::new())
    }

    /// Queues an operation over previously queued results.
    pub fn apply(&mut self, op: Arc<dyn GraphOp>, inputs: &[NodeId]) -> NodeId {
        self.push(op, inputs.to_vec())
    }

    /// Queues a closure-backed operation.
    pub fn apply_fn(
        &mut self,
        name: &'static str,
        inputs: &[NodeId],
        run: impl Fn(&[Tensor]) -> TensorResult<Tensor> + Send + Sync + 'static,
    ) -> NodeId {
        self.apply(FnOp::new(name, run), inputs)
    }

    fn push(&mut self, op: Arc<dyn GraphOp>, inputs: Vec<NodeId>) -> NodeId {
        let id = self.nodes.len();
        debug_assert!(
            inputs.iter().all(|&input| input < id),
            "graph nodes may only consume earlier results"
        );
        self.nodes.push(Node { op, inputs });
        id
    }

    /// Runs every queued operation in insertion order and returns the result
    /// of `output`. The queue is drained; the graph is ready for the next
    /// pass afterwards.
    pub fn execute(&mut self, output: NodeId) -> Result<Tensor> {
        let nodes = std::mem::take(&mut self.nodes);
        if output >= nodes.len() {
            return Err(AttentionError::shape(
                "graph output",
                format!("node {output} not queued (queue length {})", nodes.len()),
            ));
        }
        log::trace!("executing tensor graph with {} ops", nodes.len());

        let mut results: Vec<Tensor> = Vec::with_capacity(nodes.len());
        for (id, node) in nodes.iter().enumerate() {
            let inputs: Vec<Tensor> = node
                .inputs
                .iter()
                .map(|&input| results[input].clone())
                .collect();
            let value = node.op.run(&inputs).map_err(|err| {
                log::error!("graph op '{}' (node {id}) failed: {err}", node.op.name());
                AttentionError::Backend(err)
            })?;
            results.push(value);
        }
        Ok(results.swap_remove(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn executes_ops_in_insertion_order() -> Result<()> {
        let device = Device::Cpu;
        let buffer = SharedBuffer::new(Tensor::zeros((2,), DType::F32, &device)?);

        let mut graph = TensorGraph::new();
        let fresh = graph.leaf(Tensor::from_slice(&[1.0f32, 2.0], (2,), &device)?);

        // Write queued before read: the read must observe the write.
        let write_buffer = buffer.clone();
        let write = graph.apply_fn("write", &[fresh], move |inputs| {
            write_buffer.replace(inputs[0].clone());
            Ok(inputs[0].clone())
        });
        let read_buffer = buffer.clone();
        let read = graph.apply_fn("read", &[], move |_| Ok(read_buffer.snapshot()));
        let _ = write;

        let result = graph.execute(read)?;
        let values = result.to_vec1::<f32>().map_err(AttentionError::Backend)?;
        assert_eq!(values, vec![1.0, 2.0]);
        assert!(graph.is_empty());
        Ok(())
    }

    #[test]
    fn chains_results_between_nodes() -> Result<()> {
        let device = Device::Cpu;
        let mut graph = TensorGraph::new();
        let a = graph.leaf(Tensor::from_slice(&[2.0f32], (1,), &device)?);
        let b = graph.apply_fn("double", &[a], |inputs| inputs[0].affine(2.0, 0.0));
        let c = graph.apply_fn("add_one", &[b], |inputs| inputs[0].affine(1.0, 1.0));

        let result = graph.execute(c)?;
        let values = result.to_vec1::<f32>().map_err(AttentionError::Backend)?;
        assert_eq!(values, vec![5.0]);
        Ok(())
    }

    #[test]
    fn rejects_unknown_output_node() {
        let mut graph = TensorGraph::new();
        assert!(graph.execute(0).is_err());
    }

    #[test]
    fn shared_buffer_update_rewrites_in_place() -> Result<()> {
        let device = Device::Cpu;
        let buffer = SharedBuffer::new(Tensor::from_slice(&[1.0f32, 1.0], (2,), &device)?);
        buffer
            .update(|current| current.affine(3.0, 0.0))
            .map_err(AttentionError::Backend)?;
        let values = buffer
            .snapshot()
            .to_vec1::<f32>()
            .map_err(AttentionError::Backend)?;
        assert_eq!(values, vec![3.0, 3.0]);
        Ok(())
    }
}
