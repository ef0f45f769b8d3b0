use std::cell::Cell;
use std::ops::Deref;
use std::rc::Rc;

use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::Result;
use crate::shape::Shape;
use crate::storage::DataId;

// Tensor — Logical handle over engine-tracked storage
//
// A Tensor does not own data. It names a storage cell (DataId) tracked by the
// Engine's arena, together with an immutable shape and dtype. Values live in
// whichever backend currently owns the DataId; reads and disposal go through
// the Engine, which is passed explicitly.
//
// MEMORY MODEL:
//
//   The handle state is wrapped in Rc, so cloning a Tensor is cheap and every
//   clone observes the same flags:
//     - disposed: set once the Engine released this handle's reference
//     - kept:     survives every enclosing scope until disposed explicitly
//     - scope_id: the scope frame that tracked the tensor at creation
//
//   Engines are single-threaded, so the flags are plain Cells.

/// Unique identifier for a tensor, never reused within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl TensorId {
    /// Generate a new unique tensor ID (uses a global atomic counter).
    pub(crate) fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Identifier of a scope frame.
pub type ScopeId = u64;

/// What a kernel sees of a tensor: its storage, shape and dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub data_id: DataId,
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorInfo {
    pub fn new(data_id: DataId, shape: impl Into<Shape>, dtype: DType) -> Self {
        TensorInfo {
            data_id,
            shape: shape.into(),
            dtype,
        }
    }
}

struct TensorInner {
    id: TensorId,
    shape: Shape,
    dtype: DType,
    /// Rebound only by `Variable::assign`.
    data_id: Cell<DataId>,
    kept: Cell<bool>,
    disposed: Cell<bool>,
    /// Set once the tracker has counted this handle.
    tracked: Cell<bool>,
    scope_id: Cell<Option<ScopeId>>,
    is_variable: bool,
}

/// An immutable logical tensor value.
///
/// Create tensors through the [`Engine`] (`make_tensor`, `run_kernel`, ops).
#[derive(Clone)]
pub struct Tensor {
    inner: Rc<TensorInner>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={}, shape={}, dtype={}, data={}{})",
            self.inner.id.0,
            self.inner.shape,
            self.inner.dtype,
            self.inner.data_id.get(),
            if self.is_disposed() { ", disposed" } else { "" },
        )
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Tensor {}

impl Tensor {
    pub(crate) fn new(data_id: DataId, shape: Shape, dtype: DType) -> Self {
        Self::build(data_id, shape, dtype, false)
    }

    fn build(data_id: DataId, shape: Shape, dtype: DType, is_variable: bool) -> Self {
        Tensor {
            inner: Rc::new(TensorInner {
                id: TensorId::new(),
                shape,
                dtype,
                data_id: Cell::new(data_id),
                kept: Cell::new(false),
                disposed: Cell::new(false),
                tracked: Cell::new(false),
                scope_id: Cell::new(None),
                is_variable,
            }),
        }
    }

    // Accessors

    /// Unique tensor ID.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    /// The dimensions as a slice (shortcut for shape().dims()).
    pub fn dims(&self) -> &[usize] {
        self.inner.shape.dims()
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.inner.shape.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    /// Row-major strides derived from the shape.
    pub fn strides(&self) -> Vec<usize> {
        self.inner.shape.stride_contiguous()
    }

    /// Data type of the elements.
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// The storage cell currently backing this tensor.
    pub fn data_id(&self) -> DataId {
        self.inner.data_id.get()
    }

    /// Kernel-facing view of this tensor.
    pub fn info(&self) -> TensorInfo {
        TensorInfo {
            data_id: self.data_id(),
            shape: self.inner.shape.clone(),
            dtype: self.inner.dtype,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub fn is_kept(&self) -> bool {
        self.inner.kept.get()
    }

    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// Scope frame that tracked this tensor, if any.
    pub fn scope_id(&self) -> Option<ScopeId> {
        self.inner.scope_id.get()
    }

    // Engine-facing mutation

    pub(crate) fn set_data_id(&self, data_id: DataId) {
        self.inner.data_id.set(data_id);
    }

    pub(crate) fn set_kept(&self) {
        self.inner.kept.set(true);
    }

    pub(crate) fn mark_disposed(&self) {
        self.inner.disposed.set(true);
    }

    pub(crate) fn is_tracked(&self) -> bool {
        self.inner.tracked.get()
    }

    pub(crate) fn set_tracked(&self) {
        self.inner.tracked.set(true);
    }

    pub(crate) fn set_scope_id(&self, scope: ScopeId) {
        self.inner.scope_id.set(Some(scope));
    }

    // Engine shortcuts

    /// Read the values back as f64 (blocking read path).
    pub fn to_f64_vec(&self, engine: &Engine) -> Result<Vec<f64>> {
        engine.read_sync(self)?.into_f64_vec()
    }

    /// Read a single-element tensor as f64.
    pub fn to_scalar_f64(&self, engine: &Engine) -> Result<f64> {
        let values = self.to_f64_vec(engine)?;
        match values.as_slice() {
            [v] => Ok(*v),
            _ => Err(crate::Error::msg(format!(
                "to_scalar_f64: tensor has shape {}",
                self.shape()
            ))),
        }
    }

    /// Release this handle's reference to its storage. Idempotent.
    pub fn dispose(&self, engine: &mut Engine) {
        engine.dispose_tensor(self)
    }
}

// Variable — Mutable binding registered under a unique name

/// A tensor whose storage binding can be replaced by [`Variable::assign`].
///
/// Variables are never tracked by scopes; they live until disposed through
/// [`Engine::dispose_variable`] or [`Engine::dispose_variables`].
#[derive(Clone, Debug)]
pub struct Variable {
    tensor: Tensor,
    name: Rc<str>,
    trainable: bool,
}

impl Variable {
    pub(crate) fn new(data_id: DataId, shape: Shape, dtype: DType, name: &str, trainable: bool) -> Self {
        Variable {
            tensor: Tensor::build(data_id, shape, dtype, true),
            name: Rc::from(name),
            trainable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    /// The variable as a plain tensor handle.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Rebind this variable to `value`'s storage.
    ///
    /// `value` must have exactly the variable's shape and dtype.
    pub fn assign(&self, engine: &mut Engine, value: &Tensor) -> Result<()> {
        engine.assign_variable(self, value)
    }
}

impl Deref for Variable {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.tensor
    }
}

impl AsRef<Tensor> for Variable {
    fn as_ref(&self) -> &Tensor {
        &self.tensor
    }
}

impl AsRef<Tensor> for Tensor {
    fn as_ref(&self) -> &Tensor {
        self
    }
}
