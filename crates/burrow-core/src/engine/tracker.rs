use futures::future::{self, FutureExt, LocalBoxFuture};

use super::Engine;
use crate::data::TensorData;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::kernel::NamedTensors;
use crate::kernel_names;
use crate::shape::Shape;
use crate::storage::DataId;
use crate::tape::RecordedOp;
use crate::tensor::{Tensor, TensorInfo};

// Tensor tracker — lifecycle of logical handles over arena storage
//
//   track_tensor     new handle: record created on first sight of a DataId,
//                    otherwise its refcount is bumped and the owner notified
//   dispose_tensor   handle gone: refcount dropped; at zero the owner is asked
//                    to release, and the record retires only if it did
//   move_data        storage changes owner; DataId, refcount and values kept
//
// The arena refcount is the only refcount. Backends see `inc_ref` and
// `dispose_data` as notifications.

impl Engine {
    /// Write `values` to a backend and return a tracked tensor over them.
    ///
    /// `backend` selects the owning backend by name; None uses the active
    /// one.
    pub fn make_tensor(
        &mut self,
        values: impl Into<TensorData>,
        shape: impl Into<Shape>,
        dtype: DType,
        backend: Option<&str>,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let values = values.into();
        values.validate(&shape, dtype)?;
        let values = values.rounded(dtype);
        let bytes = values.byte_len(dtype);

        let backend_name = match backend {
            Some(name) => {
                self.ensure_instance(name)?;
                name.to_string()
            }
            None => self.ensure_backend()?,
        };
        let instance = self
            .instances
            .get_mut(&backend_name)
            .ok_or_else(|| Error::BackendNotFound(backend_name.clone()))?;

        let id = self.arena.reserve();
        if let Err(e) = instance.write(id, values, &shape, dtype) {
            self.arena.release_reservation(id);
            return Err(e);
        }
        let tensor = Tensor::new(id, shape, dtype);
        self.track_tensor_with_bytes(&tensor, &backend_name, Some(bytes))?;
        Ok(tensor)
    }

    /// Typed convenience over [`make_tensor`](Engine::make_tensor) on the
    /// active backend.
    pub fn tensor_from<T: WithDType>(&mut self, values: &[T], shape: impl Into<Shape>) -> Result<Tensor> {
        let values: Vec<f64> = values.iter().map(|&v| WithDType::to_f64(v)).collect();
        self.make_tensor(values, shape, T::DTYPE, None)
    }

    /// Track a new handle over storage a kernel already wrote.
    ///
    /// The DataId must be live in the tracker or freshly reserved and written
    /// to the active backend.
    pub fn make_tensor_from_info(&mut self, info: &TensorInfo) -> Result<Tensor> {
        let backend_name = match self.arena.get(info.data_id) {
            Some(record) => record.backend.clone(),
            None => self.ensure_backend()?,
        };
        let tensor = Tensor::new(info.data_id, info.shape.clone(), info.dtype);
        self.track_tensor(&tensor, &backend_name)?;
        Ok(tensor)
    }

    /// Register a handle the caller built over existing storage.
    ///
    /// The storage refcount goes up by one and the owner is notified; no
    /// data is written. Unknown DataIds are recorded as owned by
    /// `backend_name`. A handle the engine already tracks is left as is.
    pub fn inc_ref(&mut self, tensor: &Tensor, backend_name: &str) -> Result<()> {
        self.check_live(tensor)?;
        if tensor.is_tracked() {
            return Ok(());
        }
        let owner = match self.arena.get(tensor.data_id()) {
            Some(record) => record.backend.clone(),
            None => {
                self.ensure_instance(backend_name)?;
                backend_name.to_string()
            }
        };
        self.track_tensor(tensor, &owner)
    }

    /// A new handle sharing `tensor`'s storage.
    ///
    /// Recorded as an Identity node while differentiation is armed, so
    /// gradients flow through the copy.
    pub fn clone_tensor(&mut self, tensor: &Tensor) -> Result<Tensor> {
        let is_tape_on = self.is_tape_on();
        let copy = self.clone_untaped(tensor)?;
        if is_tape_on {
            let gradient = self
                .kernels
                .get_gradient(kernel_names::IDENTITY)
                .map(|config| config.gradient.clone());
            self.add_tape_node(
                kernel_names::IDENTITY,
                NamedTensors::new().with("x", tensor),
                vec![copy.clone()],
                Vec::new(),
                RecordedOp::Registered {
                    attrs: Default::default(),
                    gradient,
                },
            );
        }
        Ok(copy)
    }

    /// Release `tensor`'s reference to its storage.
    ///
    /// Disposing an already disposed or untracked tensor is a no-op.
    pub fn dispose_tensor(&mut self, tensor: &Tensor) {
        if tensor.is_disposed() || !self.arena.contains(tensor.data_id()) {
            return;
        }
        tensor.mark_disposed();
        self.release_ref(tensor);
    }

    /// Dispose every tensor reachable from `container`.
    pub fn dispose<C: crate::container::TensorContainer + ?Sized>(&mut self, container: &C) {
        for tensor in container.tensors() {
            let registered = tensor
                .is_variable()
                .then(|| self.variables.values().find(|v| v.id() == tensor.id()).cloned())
                .flatten();
            match registered {
                Some(var) => self.dispose_variable(&var),
                None => self.dispose_tensor(&tensor),
            }
        }
    }

    /// Blocking read of a tensor's values from its owning backend.
    pub fn read_sync(&self, tensor: &Tensor) -> Result<TensorData> {
        self.check_live(tensor)?;
        let id = tensor.data_id();
        let record = self.arena.record(id)?;
        let backend = self
            .instances
            .get(&record.backend)
            .ok_or_else(|| Error::BackendNotFound(record.backend.clone()))?;
        backend.read_sync(id)
    }

    /// Suspending read of a tensor's values from its owning backend.
    ///
    /// Resolves to the same values as [`read_sync`](Engine::read_sync).
    pub fn read(&self, tensor: &Tensor) -> LocalBoxFuture<'static, Result<TensorData>> {
        let lookup = self.check_live(tensor).and_then(|_| {
            let id = tensor.data_id();
            let record = self.arena.record(id)?;
            self.instances
                .get(&record.backend)
                .map(|backend| backend.read(id))
                .ok_or_else(|| Error::BackendNotFound(record.backend.clone()))
        });
        match lookup {
            Ok(read) => read,
            Err(e) => future::ready(Err(e)).boxed_local(),
        }
    }

    /// Name of the backend that owns `tensor`'s storage.
    pub fn owner_of(&self, tensor: &Tensor) -> Result<&str> {
        Ok(self.arena.record(tensor.data_id())?.backend.as_str())
    }

    /// Move storage to `backend_name`, keeping its DataId and refcount.
    ///
    /// Tensors over the storage do not observe the move.
    pub fn move_data(&mut self, id: DataId, backend_name: &str) -> Result<()> {
        let record = self.arena.record(id)?.clone();
        if record.backend == backend_name {
            return Ok(());
        }
        self.ensure_instance(backend_name)?;

        let source = self
            .instances
            .get_mut(&record.backend)
            .ok_or_else(|| Error::BackendNotFound(record.backend.clone()))?;
        let values = source.read_sync(id)?;
        source.dispose_data(id, true);

        if let Some(entry) = self.arena.get_mut(id) {
            entry.backend = backend_name.to_string();
        }
        let destination = self
            .instances
            .get_mut(backend_name)
            .ok_or_else(|| Error::BackendNotFound(backend_name.to_string()))?;
        destination.move_data(id, values, &record.shape, record.dtype, record.ref_count)?;

        if self.config.check_memory_leaks {
            if let Some(moves) = self.num_moves_stack.last_mut() {
                *moves += record.dtype.num_buffers();
            }
        }
        log::trace!("moved {} from {} to {}", id, record.backend, backend_name);
        Ok(())
    }

    // Internals

    pub(crate) fn check_live(&self, tensor: &Tensor) -> Result<()> {
        if tensor.is_disposed() {
            return Err(Error::TensorDisposed(tensor.id().as_u64()));
        }
        Ok(())
    }

    pub(crate) fn track_tensor(&mut self, tensor: &Tensor, backend_name: &str) -> Result<()> {
        self.track_tensor_with_bytes(tensor, backend_name, None)
    }

    fn track_tensor_with_bytes(
        &mut self,
        tensor: &Tensor,
        backend_name: &str,
        bytes: Option<usize>,
    ) -> Result<()> {
        let id = tensor.data_id();
        match self.arena.get_mut(id) {
            Some(record) => {
                record.ref_count += 1;
                let owner = record.backend.clone();
                if let Some(backend) = self.instances.get_mut(&owner) {
                    backend.inc_ref(id);
                }
            }
            None => {
                let bytes = match bytes {
                    Some(bytes) => bytes,
                    None => self.storage_bytes(id, tensor.shape(), tensor.dtype(), backend_name)?,
                };
                self.arena
                    .insert(id, backend_name, tensor.dtype(), tensor.shape().clone(), bytes)?;
                self.profiler.observe_bytes(self.arena.num_bytes());
            }
        }

        tensor.set_tracked();
        self.num_tensors += 1;
        if tensor.dtype() == DType::String {
            self.num_string_tensors += 1;
        }
        if !tensor.is_variable() {
            self.track_in_scope(tensor);
        }
        Ok(())
    }

    /// Byte footprint of a storage cell that has not been recorded yet.
    fn storage_bytes(&self, id: DataId, shape: &Shape, dtype: DType, backend_name: &str) -> Result<usize> {
        match dtype.size_in_bytes() {
            Some(size) => Ok(shape.elem_count() * size),
            None => {
                let backend = self
                    .instances
                    .get(backend_name)
                    .ok_or_else(|| Error::BackendNotFound(backend_name.to_string()))?;
                Ok(backend.read_sync(id)?.byte_len(dtype))
            }
        }
    }

    /// Drop one reference to the tensor's storage without touching its
    /// disposed flag.
    pub(crate) fn release_ref(&mut self, tensor: &Tensor) {
        let id = tensor.data_id();
        let Some(record) = self.arena.get_mut(id) else {
            return;
        };

        self.num_tensors = self.num_tensors.saturating_sub(1);
        if tensor.dtype() == DType::String {
            self.num_string_tensors = self.num_string_tensors.saturating_sub(1);
        }

        record.ref_count = record.ref_count.saturating_sub(1);
        if record.ref_count > 0 {
            return;
        }
        let owner = record.backend.clone();
        let released = match self.instances.get_mut(&owner) {
            Some(backend) => backend.dispose_data(id, false),
            None => true,
        };
        if released {
            self.arena.retire(id);
        } else {
            log::warn!("backend {} kept {} alive after its last reference was disposed", owner, id);
        }
    }

    /// A new tracked handle over the same storage, never recorded on the tape.
    pub(crate) fn clone_untaped(&mut self, tensor: &Tensor) -> Result<Tensor> {
        self.check_live(tensor)?;
        let backend_name = self.arena.record(tensor.data_id())?.backend.clone();
        let copy = Tensor::new(tensor.data_id(), tensor.shape().clone(), tensor.dtype());
        self.track_tensor(&copy, &backend_name)?;
        Ok(copy)
    }
}
