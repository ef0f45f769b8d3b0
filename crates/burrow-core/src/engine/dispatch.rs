use std::collections::HashSet;
use std::rc::Rc;
use std::time::Instant;

use super::Engine;
use crate::container::TensorContainer;
use crate::error::{Error, Result};
use crate::kernel::{Attrs, Kernel, KernelContext, NamedTensors};
use crate::profiler::KernelProfile;
use crate::shape::Shape;
use crate::storage::DataId;
use crate::tape::{CustomGradient, RecordedOp};
use crate::tensor::{Tensor, TensorInfo};

// Kernel dispatch
//
// Per invocation:
//
//   1. resolve the active backend (first use may instantiate one)
//   2. look up (kernel, backend)            → KernelNotFound
//   3. kernel_depth += 1                    restored on every path
//   4. move foreign inputs, run the kernel, track its outputs
//   5. leak check (config.check_memory_leaks)
//   6. record a tape node if the tape was armed when the call began
//   7. profile (only while Engine::profile runs)
//
// LEAK ARITHMETIC:
//
//   leaked = Δ backend.num_data_ids()
//          - physical buffers of distinct outputs freshly allocated here
//          - buffers moved onto the backend during the call
//
// "Fresh" means the DataId was reserved after the call started, which the
// arena serial tells apart from inputs a kernel passes straight through.
// Move counts of nested dispatches fold into the enclosing frame.

/// Outputs of one kernel invocation.
#[derive(Debug, Clone)]
pub enum KernelOutput {
    /// The kernel produced exactly one output.
    Single(Tensor),
    Many(Vec<Tensor>),
}

impl KernelOutput {
    fn from_vec(mut outputs: Vec<Tensor>) -> Self {
        if outputs.len() == 1 {
            if let Some(single) = outputs.pop() {
                return KernelOutput::Single(single);
            }
        }
        KernelOutput::Many(outputs)
    }

    /// The single output, or an error naming how many there were.
    pub fn into_single(self) -> Result<Tensor> {
        match self {
            KernelOutput::Single(t) => Ok(t),
            KernelOutput::Many(ts) => Err(Error::msg(format!(
                "expected a single kernel output, got {}",
                ts.len()
            ))),
        }
    }

    pub fn into_vec(self) -> Vec<Tensor> {
        match self {
            KernelOutput::Single(t) => vec![t],
            KernelOutput::Many(ts) => ts,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            KernelOutput::Single(_) => 1,
            KernelOutput::Many(ts) => ts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TensorContainer for KernelOutput {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        match self {
            KernelOutput::Single(t) => out.push(t.clone()),
            KernelOutput::Many(ts) => out.extend(ts.iter().cloned()),
        }
    }
}

/// Collects the tensors a custom forward function wants for its backward
/// pass. Saving is a no-op while the tape is not armed.
#[derive(Debug)]
pub struct Saver {
    record: bool,
    saved: Vec<Tensor>,
}

impl Saver {
    fn new(record: bool) -> Self {
        Saver {
            record,
            saved: Vec::new(),
        }
    }

    /// Keep a clone of each tensor for the backward pass.
    pub fn save(&mut self, engine: &mut Engine, tensors: &[Tensor]) -> Result<()> {
        if !self.record {
            return Ok(());
        }
        for tensor in tensors {
            let copy = engine.clone_untaped(tensor)?;
            self.saved.push(engine.keep(&copy));
        }
        Ok(())
    }
}

/// Snapshot taken before a kernel runs when leak checks are on.
struct LeakProbe {
    backend: String,
    num_data_ids: usize,
    first_serial: u64,
}

/// Snapshot taken before a kernel runs while profiling.
struct ProfileProbe {
    bytes: usize,
    tensors: usize,
    input_shapes: Vec<Shape>,
    started: Instant,
}

impl Engine {
    /// Execute the kernel registered as `kernel_name` for the active backend.
    pub fn run_kernel(
        &mut self,
        kernel_name: &str,
        inputs: &NamedTensors,
        attrs: &Attrs,
    ) -> Result<KernelOutput> {
        let backend_name = self.ensure_backend()?;
        for (_, tensor) in inputs.iter() {
            self.check_live(tensor)?;
        }
        let kernel = self
            .kernels
            .get_kernel(kernel_name, &backend_name)
            .map(|config| config.kernel.clone())
            .ok_or_else(|| Error::KernelNotFound {
                kernel: kernel_name.to_string(),
                backend: backend_name.clone(),
            })?;

        let is_tape_on = self.is_tape_on();
        let profile = self.profile_probe(inputs.iter().map(|(_, t)| t.shape().clone()).collect());
        let leak = self.leak_probe(&backend_name);

        self.kernel_depth += 1;
        let result = self.execute_kernel(kernel_name, &backend_name, &*kernel, inputs, attrs);
        self.kernel_depth -= 1;
        let moves = self.pop_moves(leak.is_some());

        let outputs = result?
            .into_iter()
            .map(|info| {
                let tensor = Tensor::new(info.data_id, info.shape, info.dtype);
                self.track_tensor(&tensor, &backend_name).map(|_| tensor)
            })
            .collect::<Result<Vec<Tensor>>>()?;

        if let Some(probe) = leak {
            self.check_kernel_for_leaks(kernel_name, probe, moves, &outputs)?;
        }
        if self.config.debug {
            self.check_debug_outputs(kernel_name, &backend_name, &outputs)?;
        }

        if is_tape_on {
            let grad_config = self.kernels.get_gradient(kernel_name).cloned();
            let to_save = grad_config
                .as_ref()
                .map(|config| config.select_saved(inputs, &outputs))
                .unwrap_or_default();
            let saved = self.keep_clones(&to_save)?;
            self.add_tape_node(
                kernel_name,
                inputs.clone(),
                outputs.clone(),
                saved,
                RecordedOp::Registered {
                    attrs: attrs.clone(),
                    gradient: grad_config.map(|config| config.gradient),
                },
            );
        }

        if let Some(probe) = profile {
            self.record_profile(kernel_name, probe, &outputs);
        }
        Ok(KernelOutput::from_vec(outputs))
    }

    /// Run `forward` as an opaque kernel whose gradient is `backward`.
    ///
    /// `forward` runs inside its own scope at kernel depth > 0, so the ops it
    /// dispatches are not recorded; only this call is. Tensors passed to the
    /// [`Saver`] are handed to `backward` as `saved`.
    pub fn custom_grad<F, G>(&mut self, inputs: &[Tensor], forward: F, backward: G) -> Result<Tensor>
    where
        F: FnOnce(&mut Engine, &mut Saver) -> Result<Tensor>,
        G: CustomGradient + 'static,
    {
        let backend_name = self.ensure_backend()?;
        for tensor in inputs {
            self.check_live(tensor)?;
        }

        let is_tape_on = self.is_tape_on();
        let profile = self.profile_probe(inputs.iter().map(|t| t.shape().clone()).collect());
        let leak = self.leak_probe(&backend_name);

        let mut saver = Saver::new(is_tape_on);
        self.kernel_depth += 1;
        let result = self.tidy("customGrad", |engine| forward(engine, &mut saver));
        self.kernel_depth -= 1;
        let moves = self.pop_moves(leak.is_some());
        let output = result?;

        let outputs = vec![output.clone()];
        if let Some(probe) = leak {
            self.check_kernel_for_leaks("customGrad", probe, moves, &outputs)?;
        }
        if self.config.debug {
            self.check_debug_outputs("customGrad", &backend_name, &outputs)?;
        }

        if is_tape_on {
            let mut named = NamedTensors::new();
            for (i, tensor) in inputs.iter().enumerate() {
                named.insert(&i.to_string(), tensor.clone());
            }
            self.add_tape_node(
                "customGrad",
                named,
                outputs.clone(),
                saver.saved,
                RecordedOp::Custom {
                    gradient: Rc::new(backward),
                    num_inputs: inputs.len(),
                },
            );
        }

        if let Some(probe) = profile {
            self.record_profile("customGrad", probe, &outputs);
        }
        Ok(output)
    }

    // Internals

    fn execute_kernel(
        &mut self,
        kernel_name: &str,
        backend_name: &str,
        kernel: &dyn Kernel,
        inputs: &NamedTensors,
        attrs: &Attrs,
    ) -> Result<Vec<TensorInfo>> {
        for (_, tensor) in inputs.iter() {
            let id = tensor.data_id();
            if self.arena.record(id)?.backend != backend_name {
                self.move_data(id, backend_name)?;
            }
        }
        let infos: Vec<(String, TensorInfo)> = inputs
            .iter()
            .map(|(name, tensor)| (name.to_string(), tensor.info()))
            .collect();
        let backend = self
            .instances
            .get_mut(backend_name)
            .ok_or_else(|| Error::BackendNotFound(backend_name.to_string()))?;
        let mut ctx = KernelContext::new(
            kernel_name,
            backend_name,
            &mut **backend,
            &mut self.arena,
            infos,
            attrs,
        );
        kernel.run(&mut ctx)
    }

    fn leak_probe(&mut self, backend_name: &str) -> Option<LeakProbe> {
        if !self.config.check_memory_leaks {
            return None;
        }
        self.num_moves_stack.push(0);
        Some(LeakProbe {
            backend: backend_name.to_string(),
            num_data_ids: self
                .instances
                .get(backend_name)
                .map(|b| b.num_data_ids())
                .unwrap_or(0),
            first_serial: self.arena.next_serial(),
        })
    }

    /// Pop this invocation's move counter, folding it into the parent frame.
    fn pop_moves(&mut self, pushed: bool) -> usize {
        if !pushed {
            return 0;
        }
        let moves = self.num_moves_stack.pop().unwrap_or(0);
        if let Some(parent) = self.num_moves_stack.last_mut() {
            *parent += moves;
        }
        moves
    }

    fn check_kernel_for_leaks(
        &self,
        kernel_name: &str,
        probe: LeakProbe,
        moves: usize,
        outputs: &[Tensor],
    ) -> Result<()> {
        let after = self
            .instances
            .get(&probe.backend)
            .map(|b| b.num_data_ids())
            .unwrap_or(0);

        let mut fresh: HashSet<DataId> = HashSet::new();
        let mut expected = 0usize;
        for tensor in outputs {
            let id = tensor.data_id();
            let is_fresh = self
                .arena
                .serial(id)
                .is_some_and(|serial| serial >= probe.first_serial);
            if is_fresh && fresh.insert(id) {
                expected += tensor.dtype().num_buffers();
            }
        }

        let leaked = after as i64 - probe.num_data_ids as i64 - expected as i64 - moves as i64;
        if leaked > 0 {
            return Err(Error::BackendMemoryLeak {
                backend: probe.backend,
                leaked,
                kernel: kernel_name.to_string(),
            });
        }
        Ok(())
    }

    fn check_debug_outputs(&self, kernel_name: &str, backend_name: &str, outputs: &[Tensor]) -> Result<()> {
        log::debug!(
            "{} on {}: {} output(s) {:?}",
            kernel_name,
            backend_name,
            outputs.len(),
            outputs.iter().map(|t| t.shape().to_string()).collect::<Vec<_>>()
        );
        for tensor in outputs.iter().filter(|t| t.dtype().is_float()) {
            if self.read_sync(tensor)?.has_nan() {
                return Err(Error::NanInKernelOutput(kernel_name.to_string()));
            }
        }
        Ok(())
    }

    /// Kept copies of tensors a gradient needs. The copies are themselves
    /// recorded as Identity nodes, so a nested differentiation can reach the
    /// original through them.
    fn keep_clones(&mut self, tensors: &[Tensor]) -> Result<Vec<Tensor>> {
        tensors
            .iter()
            .map(|t| {
                let copy = self.clone_tensor(t)?;
                Ok(self.keep(&copy))
            })
            .collect()
    }

    fn profile_probe(&self, input_shapes: Vec<Shape>) -> Option<ProfileProbe> {
        if !self.profiler.is_active() {
            return None;
        }
        Some(ProfileProbe {
            bytes: self.arena.num_bytes(),
            tensors: self.num_tensors,
            input_shapes,
            started: Instant::now(),
        })
    }

    fn record_profile(&mut self, kernel_name: &str, probe: ProfileProbe, outputs: &[Tensor]) {
        let kernel_time = probe.started.elapsed();
        let total_bytes = self.arena.num_bytes();
        let total_tensors = self.num_tensors;
        self.profiler.record(KernelProfile {
            name: kernel_name.to_string(),
            bytes_added: total_bytes as i64 - probe.bytes as i64,
            total_bytes_snapshot: total_bytes,
            tensors_added: total_tensors as i64 - probe.tensors as i64,
            total_tensors_snapshot: total_tensors,
            input_shapes: probe.input_shapes,
            output_shapes: outputs.iter().map(|t| t.shape().clone()).collect(),
            kernel_time,
        });
    }
}
