//! # burrow-core
//!
//! The tensor engine behind Burrow: backend registry, storage tracking,
//! scopes, kernel dispatch and reverse-mode autodiff.
//!
//! This crate provides:
//! - [`Engine`] — the context object every tensor operation goes through
//! - [`Tensor`] / [`Variable`] — handles over backend-owned storage
//! - [`Backend`] trait — the storage and kernel host a backend implements
//! - [`KernelConfig`] / [`GradConfig`] — kernel and gradient registration
//! - [`StorageArena`] — the reference-counted record of every live buffer
//!
//! Compute lives in backend crates such as `burrow-cpu`; this crate only
//! routes work to them and keeps the books.

pub mod backend;
pub mod config;
pub mod container;
pub mod data;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod gradients;
pub mod kernel;
pub mod kernel_names;
pub mod ops;
pub mod profiler;
pub mod shape;
pub mod storage;
pub mod tape;
pub mod tensor;

pub use backend::{Backend, BackendFactory, BackendInit, BackendMemory};
pub use config::EngineConfig;
pub use container::TensorContainer;
pub use data::TensorData;
pub use dtype::{DType, WithDType};
pub use engine::{
    Engine, GradientResult, InitOutcome, KernelOutput, MemoryInfo, PendingInit, Saver,
    VariableGrads, STRING_MEMORY_REASON,
};
pub use error::{Error, Result};
pub use kernel::{
    AttrValue, Attrs, GradConfig, Gradient, Kernel, KernelConfig, KernelContext, KernelRegistry,
    NamedTensors,
};
pub use profiler::{KernelProfile, ProfileInfo, ProfileReport};
pub use shape::Shape;
pub use storage::{DataId, StorageArena};
pub use tape::CustomGradient;
pub use tensor::{Tensor, TensorId, TensorInfo, Variable};
