use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::Result;
use crate::kernel::{Attrs, Gradient, NamedTensors};
use crate::tensor::{Tensor, TensorId};

// Tape — Ordered log of differentiable kernel invocations
//
// While differentiation is armed, every top-level kernel dispatch appends a
// TapeNode. Gradient replay walks the pruned tape in reverse:
//
//   tape:     n0: a = x * x      n1: b = sum(a)      n2: c = neg(z)
//   prune(xs=[x], y=b):  keep n0, n1 (n2 does not lead from x to b)
//   replay:   n1.backward(db) → da,  n0.backward(da) → dx
//
// A node's backward step is selected by its RecordedOp variant instead of a
// captured closure: registered kernels carry their attrs and the registry's
// Gradient, custom gradients carry the user's CustomGradient.

/// Backward function supplied to `Engine::custom_grad`.
///
/// Returns one gradient per input, in input order.
pub trait CustomGradient {
    fn backward(&self, engine: &mut Engine, dy: &Tensor, saved: &[Tensor]) -> Result<Vec<Tensor>>;
}

impl<F> CustomGradient for F
where
    F: Fn(&mut Engine, &Tensor, &[Tensor]) -> Result<Vec<Tensor>>,
{
    fn backward(&self, engine: &mut Engine, dy: &Tensor, saved: &[Tensor]) -> Result<Vec<Tensor>> {
        self(engine, dy, saved)
    }
}

/// How a recorded node computes its input gradients.
#[derive(Clone)]
pub enum RecordedOp {
    /// A registry kernel. `gradient` is None when no gradient was registered;
    /// replay fails only if such a node lies on a gradient path.
    Registered {
        attrs: Attrs,
        gradient: Option<Rc<dyn Gradient>>,
    },
    /// A `custom_grad` invocation over `num_inputs` inputs.
    Custom {
        gradient: Rc<dyn CustomGradient>,
        num_inputs: usize,
    },
}

impl fmt::Debug for RecordedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordedOp::Registered { attrs, gradient } => f
                .debug_struct("Registered")
                .field("attrs", attrs)
                .field("has_gradient", &gradient.is_some())
                .finish(),
            RecordedOp::Custom { num_inputs, .. } => f
                .debug_struct("Custom")
                .field("num_inputs", num_inputs)
                .finish(),
        }
    }
}

/// One recorded kernel invocation.
#[derive(Debug, Clone)]
pub struct TapeNode {
    pub id: u64,
    pub kernel_name: String,
    pub inputs: NamedTensors,
    pub outputs: Vec<Tensor>,
    /// Kept clones, disposed when the outermost differentiation call ends.
    pub saved: Vec<Tensor>,
    pub op: RecordedOp,
}

/// Restrict `tape` to the nodes on some path from a tensor in `xs` to `y`.
///
/// Kept nodes have their inputs pruned to the ones reachable from `xs`, so
/// replay only accumulates gradients that matter. Node order is preserved.
pub fn filter_nodes_x_to_y(tape: &[TapeNode], xs: &[Tensor], y: &Tensor) -> Vec<TapeNode> {
    // Forward pass: tensors and nodes reachable from xs.
    let mut from_x: HashSet<TensorId> = xs.iter().map(Tensor::id).collect();
    let mut nodes_from_x: HashSet<u64> = HashSet::new();
    for node in tape {
        if node.inputs.iter().any(|(_, t)| from_x.contains(&t.id())) {
            from_x.extend(node.outputs.iter().map(Tensor::id));
            nodes_from_x.insert(node.id);
        }
    }

    // Backward pass: tensors and nodes that lead to y.
    let mut leads_to_y: HashSet<TensorId> = HashSet::new();
    leads_to_y.insert(y.id());
    let mut nodes_to_y: HashSet<u64> = HashSet::new();
    for node in tape.iter().rev() {
        if node.outputs.iter().any(|t| leads_to_y.contains(&t.id())) {
            leads_to_y.extend(node.inputs.iter().map(|(_, t)| t.id()));
            nodes_to_y.insert(node.id);
        }
    }

    tape.iter()
        .filter(|node| nodes_from_x.contains(&node.id) && nodes_to_y.contains(&node.id))
        .map(|node| {
            let mut pruned = node.clone();
            pruned.inputs.retain(|_, t| from_x.contains(&t.id()));
            pruned
        })
        .collect()
}
