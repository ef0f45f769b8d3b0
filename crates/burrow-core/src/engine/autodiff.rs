use std::collections::HashMap;

use super::Engine;
use crate::container::TensorContainer;
use crate::error::{Error, Result};
use crate::kernel::NamedTensors;
use crate::tape::{filter_nodes_x_to_y, RecordedOp, TapeNode};
use crate::tensor::{Tensor, TensorId, Variable};

// Autodiff — tape arming and reverse-mode replay
//
//   gradient_depth   re-entrant; the tape is allocated on 0 → 1 and every
//                    nested differentiation appends to the same tape
//   is_tape_on       gradient_depth > 0 && kernel_depth == 0
//
// gradients(f, xs, dy):
//
//   forward    run f in a tidy scope with the tape armed → y
//   prune      keep nodes on a path from some x to y
//   backward   in a tidy scope: seed y with dy (or ones), replay the pruned
//              nodes newest first, summing partial gradients per tensor
//   cleanup    outermost call only: dispose saved tensors, drop the tape

/// Value and gradients returned by [`Engine::gradients`].
#[derive(Debug, Clone)]
pub struct GradientResult {
    /// The tensor `f` produced.
    pub value: Tensor,
    /// One entry per x; None when x did not influence the value.
    pub grads: Vec<Option<Tensor>>,
}

impl TensorContainer for GradientResult {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        out.push(self.value.clone());
        self.grads.collect_tensors(out);
    }
}

/// Value and per-variable gradients returned by [`Engine::variable_grads`].
#[derive(Debug, Clone)]
pub struct VariableGrads {
    pub value: Tensor,
    /// Gradients keyed by variable name; variables that did not influence
    /// the value are absent.
    pub grads: NamedTensors,
}

impl TensorContainer for VariableGrads {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        out.push(self.value.clone());
        self.grads.collect_tensors(out);
    }
}

impl Engine {
    /// Whether kernel invocations are currently being recorded.
    pub fn is_tape_on(&self) -> bool {
        self.gradient_depth > 0 && self.kernel_depth == 0
    }

    /// Current gradient nesting depth.
    pub fn gradient_depth(&self) -> usize {
        self.gradient_depth
    }

    /// Number of nodes on the active tape.
    pub fn tape_len(&self) -> usize {
        self.active_tape.as_ref().map_or(0, Vec::len)
    }

    /// Arm recording. The first start allocates a fresh tape.
    pub fn start_tape(&mut self) {
        if self.gradient_depth == 0 {
            self.active_tape = Some(Vec::new());
        }
        self.gradient_depth += 1;
    }

    /// Disarm one level of recording. The tape itself survives until the
    /// outermost differentiation call cleans it up.
    pub fn end_tape(&mut self) {
        self.gradient_depth = self.gradient_depth.saturating_sub(1);
    }

    /// Differentiate the single tensor produced by `f` with respect to `xs`.
    ///
    /// `dy` seeds the gradient of the value (all ones when None) and must be
    /// floating point. With `allow_no_gradients` false, a value that no x
    /// influences fails with `DisconnectedGradientGraph`; with true, those
    /// grads are None.
    pub fn gradients<T, F>(
        &mut self,
        f: F,
        xs: &[Tensor],
        dy: Option<&Tensor>,
        allow_no_gradients: bool,
    ) -> Result<GradientResult>
    where
        T: TensorContainer,
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        if xs.is_empty() {
            return Err(Error::EmptyGradientTargets);
        }
        if let Some(dy) = dy {
            self.check_live(dy)?;
            if !dy.dtype().is_float() {
                return Err(Error::WrongGradientSeedDtype(dy.dtype()));
            }
        }

        self.start_tape();
        let forward = self.tidy("forward", f);
        self.end_tape();

        let result = forward.and_then(|out| {
            let mut ys = out.tensors();
            if ys.len() != 1 {
                return Err(Error::GradientTargetNotATensor(ys.len()));
            }
            let y = ys.remove(0);
            let grads = self.backward_from(&y, xs, dy, allow_no_gradients)?;
            Ok(GradientResult { value: y, grads })
        });

        self.finish_tape_if_outermost();
        result
    }

    /// Gradients of a scalar-valued `f` with respect to variables.
    ///
    /// With `vars` None, every registered trainable variable is used.
    /// Variables that do not influence the value get no entry.
    pub fn variable_grads<F>(&mut self, f: F, vars: Option<&[Variable]>) -> Result<VariableGrads>
    where
        F: FnOnce(&mut Engine) -> Result<Tensor>,
    {
        let vars: Vec<Variable> = match vars {
            Some(vars) => vars.iter().filter(|v| v.trainable()).cloned().collect(),
            None => self.variables.values().filter(|v| v.trainable()).cloned().collect(),
        };
        if vars.is_empty() {
            return Err(Error::EmptyGradientTargets);
        }
        let xs: Vec<Tensor> = vars.iter().map(|v| v.tensor().clone()).collect();

        let result = self.gradients(
            |engine| {
                let value = f(engine)?;
                if value.rank() != 0 {
                    return Err(Error::msg(format!(
                        "variable_grads() expects f to return a scalar, got shape {}",
                        value.shape()
                    )));
                }
                Ok(value)
            },
            &xs,
            None,
            true,
        )?;

        let mut grads = NamedTensors::new();
        for (var, grad) in vars.iter().zip(result.grads) {
            if let Some(grad) = grad {
                grads.insert(var.name(), grad);
            }
        }
        Ok(VariableGrads {
            value: result.value,
            grads,
        })
    }

    // Internals

    pub(crate) fn add_tape_node(
        &mut self,
        kernel_name: &str,
        inputs: NamedTensors,
        outputs: Vec<Tensor>,
        saved: Vec<Tensor>,
        op: RecordedOp,
    ) {
        let id = self.next_tape_node_id;
        self.next_tape_node_id += 1;
        if let Some(tape) = self.active_tape.as_mut() {
            tape.push(TapeNode {
                id,
                kernel_name: kernel_name.to_string(),
                inputs,
                outputs,
                saved,
                op,
            });
        }
    }

    fn backward_from(
        &mut self,
        y: &Tensor,
        xs: &[Tensor],
        dy: Option<&Tensor>,
        allow_no_gradients: bool,
    ) -> Result<Vec<Option<Tensor>>> {
        let filtered = match &self.active_tape {
            Some(tape) => filter_nodes_x_to_y(tape, xs, y),
            None => Vec::new(),
        };
        if filtered.is_empty() && !allow_no_gradients {
            return Err(Error::DisconnectedGradientGraph);
        }

        self.tidy("backward", |engine| {
            let mut accumulated: HashMap<TensorId, Tensor> = HashMap::new();
            let seed = match dy {
                Some(dy) => dy.clone(),
                None => engine.ones_like(y)?,
            };
            accumulated.insert(y.id(), seed);
            engine.backprop(&filtered, &mut accumulated)?;
            Ok(xs
                .iter()
                .map(|x| accumulated.get(&x.id()).cloned())
                .collect::<Vec<Option<Tensor>>>())
        })
    }

    /// Replay `tape` newest first, accumulating into `accumulated`.
    fn backprop(&mut self, tape: &[TapeNode], accumulated: &mut HashMap<TensorId, Tensor>) -> Result<()> {
        for node in tape.iter().rev() {
            let dys = node
                .outputs
                .iter()
                .map(|output| match accumulated.get(&output.id()) {
                    Some(grad) => Ok(grad.clone()),
                    None => self.zeros(output.shape().clone(), output.dtype()),
                })
                .collect::<Result<Vec<Tensor>>>()?;

            let input_grads = match &node.op {
                RecordedOp::Registered {
                    attrs,
                    gradient: Some(gradient),
                } => gradient.backward(self, &dys, &node.saved, attrs)?,
                RecordedOp::Registered { gradient: None, .. } => {
                    return Err(Error::MissingGradientFunction(node.kernel_name.clone()));
                }
                RecordedOp::Custom {
                    gradient,
                    num_inputs,
                } => {
                    let dy = dys
                        .first()
                        .ok_or_else(|| Error::msg("custom gradient node without outputs"))?;
                    let grads = gradient.backward(self, dy, &node.saved)?;
                    if grads.len() != *num_inputs {
                        return Err(Error::CustomGradientArity {
                            expected: *num_inputs,
                            got: grads.len(),
                        });
                    }
                    let mut named = NamedTensors::new();
                    for (i, grad) in grads.into_iter().enumerate() {
                        named.insert(&i.to_string(), grad);
                    }
                    named
                }
            };

            for (name, x) in node.inputs.iter() {
                let dx = input_grads
                    .get(name)
                    .ok_or_else(|| Error::MissingInputGradient {
                        kernel: node.kernel_name.clone(),
                        input: name.to_string(),
                        available: input_grads.names(),
                    })?
                    .clone();
                if dx.shape() != x.shape() {
                    return Err(Error::GradientShapeMismatch {
                        kernel: node.kernel_name.clone(),
                        input: name.to_string(),
                        expected: x.shape().clone(),
                        got: dx.shape().clone(),
                    });
                }
                let total = match accumulated.get(&x.id()) {
                    Some(current) => {
                        let current = current.clone();
                        self.add(&current, &dx)?
                    }
                    None => dx,
                };
                accumulated.insert(x.id(), total);
            }
        }
        Ok(())
    }

    fn finish_tape_if_outermost(&mut self) {
        if self.gradient_depth != 0 {
            return;
        }
        if let Some(tape) = self.active_tape.take() {
            for node in &tape {
                for tensor in &node.saved {
                    self.dispose_tensor(tensor);
                }
            }
        }
    }
}
