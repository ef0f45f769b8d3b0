// Engine — Orchestrator of backends, storage, scopes and the gradient tape
//
// An Engine is an explicitly constructed context object. Everything that
// creates, reads or disposes tensors takes it as `&mut Engine`:
//
//   let mut engine = Engine::new(EngineConfig::default());
//   burrow_cpu::register(&mut engine, 1);
//   let x = engine.tensor_from::<f32>(&[3.0], ())?;
//   let y = engine.tidy("square", |e| e.mul(&x, &x))?;
//
// STATE:
//
//   backends   name → factory/priority, name → instance, the active name,
//              and the stamp of any in-flight async initialization
//   arena      the storage tracker (one record per live DataId)
//   scopes     stack of tracking frames used by tidy/start_scope/end_scope
//   tape       recorded kernel invocations while differentiation is armed
//   variables  name → Variable
//
// The Engine is single-threaded (`Rc` and `Cell` inside tensors), which is
// what lets every structure above be mutated without locks.

mod autodiff;
mod backends;
mod dispatch;
mod scope;
mod tracker;
mod variables;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};

pub use autodiff::{GradientResult, VariableGrads};
pub use backends::{InitOutcome, PendingInit};
pub use dispatch::{KernelOutput, Saver};

use crate::backend::{Backend, BackendMemory};
use crate::config::EngineConfig;
use crate::gradients::register_default_gradients;
use crate::kernel::{GradConfig, KernelConfig, KernelRegistry};
use crate::error::Result;
use crate::profiler::{ProfileInfo, Profiler};
use crate::storage::StorageArena;
use crate::tape::TapeNode;
use crate::tensor::Variable;

use backends::RegistryEntry;
use scope::ScopeFrame;

/// Reason reported by [`Engine::memory`] while string tensors are live.
pub const STRING_MEMORY_REASON: &str =
    "Memory usage by string tensors is approximate (counted as raw UTF-8 bytes)";

/// Snapshot returned by [`Engine::memory`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryInfo {
    /// Live logical tensor handles.
    pub num_tensors: usize,
    /// Live storage records.
    pub num_data_buffers: usize,
    /// Sum of the byte footprints of all live storage records.
    pub num_bytes: usize,
    /// Whether `num_bytes` is known to be approximate.
    pub unreliable: bool,
    pub reasons: Vec<String>,
    /// Statistics of the active backend, if one is active.
    pub backend: BackendMemory,
}

/// The tensor engine. See the module documentation for an overview.
pub struct Engine {
    config: EngineConfig,

    // Backends
    registry: BTreeMap<String, RegistryEntry>,
    instances: HashMap<String, Box<dyn Backend>>,
    active_backend: Option<String>,
    pending_init: Option<PendingInit>,
    initializing: Option<(String, u64)>,
    pending_init_id: u64,
    next_registration: u64,

    kernels: KernelRegistry,

    // Tracker
    arena: StorageArena,
    num_tensors: usize,
    num_string_tensors: usize,

    // Scopes
    scopes: Vec<ScopeFrame>,
    next_scope_id: u64,

    // Dispatch and tape
    kernel_depth: usize,
    gradient_depth: usize,
    active_tape: Option<Vec<TapeNode>>,
    next_tape_node_id: u64,
    num_moves_stack: Vec<usize>,
    profiler: Profiler,

    variables: BTreeMap<String, Variable>,
    next_variable_id: u64,
}

impl Engine {
    /// Create an engine with no backends registered and the default
    /// gradients installed.
    pub fn new(config: EngineConfig) -> Self {
        let mut kernels = KernelRegistry::new();
        register_default_gradients(&mut kernels);
        Engine {
            config,
            registry: BTreeMap::new(),
            instances: HashMap::new(),
            active_backend: None,
            pending_init: None,
            initializing: None,
            pending_init_id: 0,
            next_registration: 0,
            kernels,
            arena: StorageArena::new(),
            num_tensors: 0,
            num_string_tensors: 0,
            scopes: Vec::new(),
            next_scope_id: 0,
            kernel_depth: 0,
            gradient_depth: 0,
            active_tape: None,
            next_tape_node_id: 0,
            num_moves_stack: Vec::new(),
            profiler: Profiler::default(),
            variables: BTreeMap::new(),
            next_variable_id: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    // Kernel registry

    pub fn kernel_registry(&self) -> &KernelRegistry {
        &self.kernels
    }

    pub fn kernel_registry_mut(&mut self) -> &mut KernelRegistry {
        &mut self.kernels
    }

    /// Register a kernel implementation for one backend.
    pub fn register_kernel(&mut self, config: KernelConfig) {
        self.kernels.register_kernel(config);
    }

    /// Register the gradient of a kernel, shared by all backends.
    pub fn register_gradient(&mut self, config: GradConfig) {
        self.kernels.register_gradient(config);
    }

    // Memory

    /// Live tensor/buffer/byte counts plus the active backend's statistics.
    pub fn memory(&self) -> MemoryInfo {
        let backend = self
            .active_backend
            .as_ref()
            .and_then(|name| self.instances.get(name))
            .map(|b| b.memory())
            .unwrap_or_default();

        let mut reasons = Vec::new();
        if self.num_string_tensors > 0 {
            reasons.push(STRING_MEMORY_REASON.to_string());
        }
        if backend.unreliable {
            reasons.extend(backend.reasons.iter().cloned());
        }

        MemoryInfo {
            num_tensors: self.num_tensors,
            num_data_buffers: self.arena.num_live(),
            num_bytes: self.arena.num_bytes(),
            unreliable: !reasons.is_empty() || backend.unreliable,
            reasons,
            backend,
        }
    }

    /// Number of live logical tensor handles.
    pub fn num_tensors(&self) -> usize {
        self.num_tensors
    }

    /// Number of live storage records.
    pub fn num_data_buffers(&self) -> usize {
        self.arena.num_live()
    }

    /// Read-only view of the storage tracker.
    pub fn storage(&self) -> &StorageArena {
        &self.arena
    }

    /// Run `f` while recording every kernel it dispatches.
    pub fn profile<T, F>(&mut self, f: F) -> Result<(T, ProfileInfo)>
    where
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        let start_bytes = self.arena.num_bytes();
        let start_tensors = self.num_tensors;
        let previous = self.profiler.start(start_bytes);
        let result = f(self);
        let (kernels, peak_bytes) = self.profiler.finish(previous);
        let value = result?;
        let info = ProfileInfo {
            new_bytes: self.arena.num_bytes() as i64 - start_bytes as i64,
            new_tensors: self.num_tensors as i64 - start_tensors as i64,
            peak_bytes,
            kernels,
        };
        Ok((value, info))
    }

    /// Tear down every backend instance and all tracked state.
    ///
    /// Backend factories and kernel/gradient registrations survive; the next
    /// use re-resolves a backend. Handles created before the reset are
    /// disposed or dangling afterwards.
    pub fn reset(&mut self) {
        self.pending_init_id += 1;
        self.pending_init = None;
        self.initializing = None;

        for frame in self.scopes.drain(..) {
            frame.track.iter().for_each(|t| t.mark_disposed());
        }
        if let Some(tape) = self.active_tape.take() {
            for node in tape {
                node.saved.iter().for_each(|t| t.mark_disposed());
            }
        }
        for var in std::mem::take(&mut self.variables).into_values() {
            var.mark_disposed();
        }

        let names: Vec<String> = self.instances.keys().cloned().collect();
        for name in names {
            self.dispose_backend_instance(&name);
        }
        self.active_backend = None;

        self.arena.clear();
        self.num_tensors = 0;
        self.num_string_tensors = 0;
        self.next_scope_id = 0;
        self.kernel_depth = 0;
        self.gradient_depth = 0;
        self.next_tape_node_id = 0;
        self.num_moves_stack.clear();
        self.profiler = Profiler::default();
        self.next_variable_id = 0;
        log::debug!("engine reset");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("backends", &self.registry.keys().collect::<Vec<_>>())
            .field("active_backend", &self.active_backend)
            .field("num_tensors", &self.num_tensors)
            .field("num_data_buffers", &self.arena.num_live())
            .field("scope_depth", &self.scopes.len())
            .field("gradient_depth", &self.gradient_depth)
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
