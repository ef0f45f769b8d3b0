use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within Burrow.
///
/// Configuration errors (unknown backends or kernels, duplicate variable
/// names), usage errors (disposed tensors, mismatched assignments, empty or
/// disconnected gradient requests) and internal invariant violations (backend
/// leaks) all surface through this one enum so callers can match on the kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No factory was registered under this backend name.
    #[error("backend '{0}' not found in registry")]
    BackendNotFound(String),

    /// Backend resolution was attempted with an empty registry.
    #[error("no backends registered")]
    NoBackendsRegistered,

    /// Every registered factory failed to produce a backend.
    #[error("could not initialize any backend, all backend initializations failed")]
    NoBackendAvailable,

    /// The best backend is still initializing asynchronously.
    #[error("backend '{0}' has not yet been initialized, await `Engine::ready()` before using it")]
    BackendNotInitialized(String),

    /// The kernel registry has no implementation for this (kernel, backend) pair.
    #[error("kernel '{kernel}' not registered for backend '{backend}'")]
    KernelNotFound { kernel: String, backend: String },

    /// A kernel left unexplained storage allocated on the backend.
    #[error("backend '{backend}' has an internal memory leak ({leaked} data ids) after running '{kernel}'")]
    BackendMemoryLeak {
        backend: String,
        leaked: i64,
        kernel: String,
    },

    /// The tensor was disposed and can no longer be read or used as an input.
    #[error("tensor {0} is disposed")]
    TensorDisposed(u64),

    /// A storage id that is not live in the tracker.
    #[error("unknown or freed data id {0}")]
    UnknownDataId(String),

    /// A variable with this name is already registered.
    #[error("variable with name '{0}' was already registered")]
    DuplicateVariableName(String),

    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between two tensors.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Element count mismatch when creating a tensor from values.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// The host values do not match the encoding the dtype needs.
    #[error("values of kind '{got}' cannot be stored as dtype {dtype}")]
    ValuesDTypeMismatch { dtype: DType, got: &'static str },

    /// An operation does not support this dtype.
    #[error("{op} does not support dtype {dtype}")]
    UnsupportedDType { op: String, dtype: DType },

    /// `gradients()` was called with no tensors to differentiate against.
    #[error("gradients() received an empty list of xs")]
    EmptyGradientTargets,

    /// The gradient seed must be floating point.
    #[error("dy must have a floating point dtype, got {0}")]
    WrongGradientSeedDtype(DType),

    /// The differentiated function did not produce exactly one tensor.
    #[error("the result y returned by f() must be a single tensor, got {0} tensors")]
    GradientTargetNotATensor(usize),

    /// No recorded operation connects any x to y.
    #[error(
        "cannot compute gradient of y=f(x) with respect to x, make sure that f encloses \
         all operations that lead from x to y"
    )]
    DisconnectedGradientGraph,

    /// A node on the gradient path has no registered gradient.
    #[error("cannot compute gradient: gradient function not found for '{0}'")]
    MissingGradientFunction(String),

    /// A gradient function did not produce a gradient for one of its inputs.
    #[error("cannot backprop through input '{input}' of '{kernel}', available gradients: {available:?}")]
    MissingInputGradient {
        kernel: String,
        input: String,
        available: Vec<String>,
    },

    /// A gradient function produced a gradient with the wrong shape.
    #[error("gradient for input '{input}' of '{kernel}' has shape {got}, expected {expected}")]
    GradientShapeMismatch {
        kernel: String,
        input: String,
        expected: Shape,
        got: Shape,
    },

    /// A custom gradient returned the wrong number of input gradients.
    #[error("custom gradient returned {got} gradients for {expected} inputs")]
    CustomGradientArity { expected: usize, got: usize },

    /// A kernel asked for a named input that was not supplied.
    #[error("kernel '{kernel}' is missing input '{input}'")]
    MissingKernelInput { kernel: String, input: String },

    /// A kernel asked for an attribute that was not supplied or has the wrong type.
    #[error("kernel '{kernel}' is missing attribute '{attr}'")]
    MissingAttr { kernel: String, attr: String },

    /// Debug mode found a NaN in a kernel's output.
    #[error("the result of the '{0}' kernel contains NaN")]
    NanInKernelOutput(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Burrow.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
