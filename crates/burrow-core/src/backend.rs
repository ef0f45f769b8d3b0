use futures::future::LocalBoxFuture;

use crate::data::TensorData;
use crate::dtype::DType;
use crate::error::Result;
use crate::shape::Shape;
use crate::storage::DataId;

// Backend — Abstraction over physical tensor storage
//
// The Engine treats backends as interchangeable, priority-ranked
// implementations of this trait, held as `Box<dyn Backend>` behind a
// name-keyed registry. A backend owns physical buffers keyed by the DataIds
// the Engine mints; it never decides identity or lifetime on its own.
//
// REFERENCE COUNTING:
//
//   The Engine's storage arena holds the only authoritative refcount. A
//   backend is told about new handles through `inc_ref` and is asked to
//   `dispose_data` once the arena count reaches zero (or, with `force`, when
//   the storage is being moved away or the engine is torn down). Returning
//   false from `dispose_data` means the backend kept the buffer alive; the
//   Engine then keeps its record too.
//
// READ PATHS:
//
//   `read_sync` blocks until values are available. `read` returns a future
//   for schedulers that must not block. Both return identical values.

/// Backend-specific memory statistics, surfaced through `Engine::memory()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendMemory {
    /// Bytes the backend itself reports holding, if it tracks them.
    pub num_bytes_in_backend: Option<usize>,
    /// Whether the numbers above are known to be approximate.
    pub unreliable: bool,
    /// Why the numbers are approximate.
    pub reasons: Vec<String>,
}

/// The capability set every compute backend provides to the Engine.
///
/// All methods take DataIds minted by the Engine; a backend must not reuse
/// them for anything else.
pub trait Backend {
    /// Store `values` for a new storage cell `id`.
    fn write(&mut self, id: DataId, values: TensorData, shape: &Shape, dtype: DType) -> Result<()>;

    /// Suspending read of the values behind `id`.
    fn read(&self, id: DataId) -> LocalBoxFuture<'static, Result<TensorData>>;

    /// Blocking read of the values behind `id`.
    fn read_sync(&self, id: DataId) -> Result<TensorData>;

    /// Release the buffer behind `id`. Returns whether it was actually freed.
    fn dispose_data(&mut self, id: DataId, force: bool) -> bool;

    /// A new logical handle now references `id`.
    fn inc_ref(&mut self, _id: DataId) {}

    /// Number of live physical buffers.
    fn num_data_ids(&self) -> usize;

    /// Receive storage moved from another backend, keeping its refcount.
    fn move_data(
        &mut self,
        id: DataId,
        values: TensorData,
        shape: &Shape,
        dtype: DType,
        ref_count: usize,
    ) -> Result<()>;

    /// Backend-specific memory statistics.
    fn memory(&self) -> BackendMemory {
        BackendMemory::default()
    }

    /// Release every resource the backend holds.
    fn dispose(&mut self) {}
}

/// Result of invoking a backend factory.
pub enum BackendInit {
    /// The backend is usable immediately.
    Ready(Box<dyn Backend>),
    /// The backend becomes usable when the future resolves.
    Pending(LocalBoxFuture<'static, Result<Box<dyn Backend>>>),
}

impl BackendInit {
    /// Wrap a synchronously constructed backend.
    pub fn ready(backend: impl Backend + 'static) -> Self {
        BackendInit::Ready(Box::new(backend))
    }

    /// Wrap an asynchronously constructed backend.
    pub fn pending<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<Box<dyn Backend>>> + 'static,
    {
        BackendInit::Pending(Box::pin(future))
    }
}

impl std::fmt::Debug for BackendInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendInit::Ready(_) => write!(f, "BackendInit::Ready"),
            BackendInit::Pending(_) => write!(f, "BackendInit::Pending"),
        }
    }
}

/// Produces a backend instance on demand. Called at most once per
/// successful instantiation; called again after `Engine::reset`.
pub type BackendFactory = Box<dyn Fn() -> Result<BackendInit>>;
