//! # Burrow
//!
//! A small tensor runtime with pluggable backends and reverse-mode autodiff.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use burrow::prelude::*;
//!
//! # fn main() -> burrow::Result<()> {
//! let mut engine = burrow::default_engine();
//! let x = engine.tensor_from::<f32>(&[3.0], ())?;
//! let g = engine.gradients(|e| e.square(&x), &[x.clone()], None, false)?;
//! assert_eq!(g.grads[0].as_ref().unwrap().to_scalar_f64(&engine)?, 6.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `burrow-core` | Engine, Tensor, storage tracking, scopes, kernel registry, autodiff |
//! | `burrow-cpu` | Host-memory backend and kernels, rayon for large element-wise loops |

/// Re-export core types.
pub use burrow_core::{
    Attrs, AttrValue, Backend, BackendFactory, BackendInit, BackendMemory, CustomGradient, DType,
    DataId, Engine, EngineConfig, Error, GradConfig, Gradient, GradientResult, InitOutcome, Kernel,
    KernelConfig, KernelContext, KernelOutput, KernelRegistry, MemoryInfo, NamedTensors,
    PendingInit, ProfileInfo, Result, Saver, Shape, Tensor, TensorContainer, TensorData, TensorId,
    TensorInfo, Variable, VariableGrads, WithDType, STRING_MEMORY_REASON,
};

/// Kernel name constants shared by ops, gradients and backends.
pub use burrow_core::kernel_names;

/// Re-export the CPU backend.
pub mod cpu {
    pub use burrow_cpu::*;
}

/// An engine configured from the environment with the CPU backend
/// registered at priority 1.
pub fn default_engine() -> Engine {
    let config = EngineConfig::from_env();
    log::debug!("creating engine with {:?}", config);
    let mut engine = Engine::new(config);
    burrow_cpu::register(&mut engine, 1);
    engine
}

/// Convenient imports.
pub mod prelude {
    pub use crate::{
        DType, Engine, EngineConfig, Error, Result, Shape, Tensor, TensorContainer, TensorData,
        Variable, WithDType,
    };
}
