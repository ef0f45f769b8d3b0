// CPU Backend — Host-memory reference backend for the Burrow engine
//
// Buffers live in a HashMap keyed by the DataIds the Engine mints. The
// backend keeps no refcounts of its own: the Engine's storage arena asks it
// to drop a buffer once the last handle is gone.
//
// USAGE:
//   let mut engine = Engine::new(EngineConfig::default());
//   burrow_cpu::register(&mut engine, 1);
//   let x = engine.tensor_from::<f32>(&[1.0, 2.0], 2)?;
//
// `register_as` installs the same backend under another name, which is how
// tests stand up several independent backends in one engine.

mod kernels;
mod storage;

use std::collections::HashMap;

use futures::future::{self, FutureExt, LocalBoxFuture};

use burrow_core::backend::{Backend, BackendInit, BackendMemory};
use burrow_core::data::TensorData;
use burrow_core::dtype::DType;
use burrow_core::engine::Engine;
use burrow_core::error::{Error, Result};
use burrow_core::shape::Shape;
use burrow_core::storage::DataId;

pub use kernels::{register_cpu_kernels, PARALLEL_THRESHOLD};
pub use storage::CpuStorage;

/// Name the backend registers under by default.
pub const BACKEND_NAME: &str = "cpu";

/// Reason reported by [`CpuBackend::memory`] while string buffers are held.
const STRING_REASON: &str = "String buffers are counted by the byte length of their contents; \
     allocator overhead is not included.";

/// The CPU backend.
#[derive(Debug, Default)]
pub struct CpuBackend {
    buffers: HashMap<DataId, CpuStorage>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the typed buffer behind `id`.
    pub fn storage(&self, id: DataId) -> Option<&CpuStorage> {
        self.buffers.get(&id)
    }

    fn lookup(&self, id: DataId) -> Result<&CpuStorage> {
        self.buffers
            .get(&id)
            .ok_or_else(|| Error::UnknownDataId(id.to_string()))
    }
}

impl Backend for CpuBackend {
    fn write(&mut self, id: DataId, values: TensorData, shape: &Shape, dtype: DType) -> Result<()> {
        values.validate(shape, dtype)?;
        let storage = CpuStorage::from_data(values, dtype)?;
        self.buffers.insert(id, storage);
        Ok(())
    }

    fn read(&self, id: DataId) -> LocalBoxFuture<'static, Result<TensorData>> {
        future::ready(self.read_sync(id)).boxed_local()
    }

    fn read_sync(&self, id: DataId) -> Result<TensorData> {
        Ok(self.lookup(id)?.to_data())
    }

    fn dispose_data(&mut self, id: DataId, _force: bool) -> bool {
        if self.buffers.remove(&id).is_none() {
            log::trace!("cpu: dispose of unknown {}", id);
        }
        true
    }

    fn num_data_ids(&self) -> usize {
        self.buffers.values().map(CpuStorage::num_buffers).sum()
    }

    fn move_data(
        &mut self,
        id: DataId,
        values: TensorData,
        shape: &Shape,
        dtype: DType,
        _ref_count: usize,
    ) -> Result<()> {
        self.write(id, values, shape, dtype)
    }

    fn memory(&self) -> BackendMemory {
        let has_strings = self
            .buffers
            .values()
            .any(|s| matches!(s, CpuStorage::String(_)));
        BackendMemory {
            num_bytes_in_backend: Some(self.buffers.values().map(CpuStorage::byte_len).sum()),
            unreliable: has_strings,
            reasons: if has_strings {
                vec![STRING_REASON.to_string()]
            } else {
                Vec::new()
            },
        }
    }

    fn dispose(&mut self) {
        log::debug!("cpu: releasing {} buffers", self.buffers.len());
        self.buffers.clear();
    }
}

/// Register the CPU backend as [`BACKEND_NAME`] together with its kernels.
///
/// Returns false if a backend of that name was already registered.
pub fn register(engine: &mut Engine, priority: i32) -> bool {
    register_as(engine, BACKEND_NAME, priority)
}

/// Register a CPU backend and its kernels under `name`.
pub fn register_as(engine: &mut Engine, name: &str, priority: i32) -> bool {
    if !engine.register_backend(name, || Ok(BackendInit::ready(CpuBackend::new())), priority) {
        return false;
    }
    register_cpu_kernels(engine.kernel_registry_mut(), name);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::config::EngineConfig;
    use burrow_core::dtype::DType;

    fn engine() -> Engine {
        let mut engine = Engine::new(EngineConfig::default().with_leak_checks(true));
        register(&mut engine, 1);
        engine
    }

    #[test]
    fn test_add_mul_values() {
        let mut e = engine();
        let a = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], 3).unwrap();
        let b = e.tensor_from::<f32>(&[4.0, 5.0, 6.0], 3).unwrap();
        let s = e.add(&a, &b).unwrap();
        let p = e.mul(&a, &b).unwrap();
        assert_eq!(s.to_f64_vec(&e).unwrap(), vec![5.0, 7.0, 9.0]);
        assert_eq!(p.to_f64_vec(&e).unwrap(), vec![4.0, 10.0, 18.0]);
    }

    #[test]
    fn test_scalar_broadcast_either_side() {
        let mut e = engine();
        let a = e.tensor_from::<f64>(&[1.0, 2.0], 2).unwrap();
        let two = e.scalar(2.0, DType::F64).unwrap();
        let left = e.sub(&two, &a).unwrap();
        let right = e.sub(&a, &two).unwrap();
        assert_eq!(left.dims(), &[2]);
        assert_eq!(left.to_f64_vec(&e).unwrap(), vec![1.0, 0.0]);
        assert_eq!(right.to_f64_vec(&e).unwrap(), vec![-1.0, 0.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut e = engine();
        let a = e.tensor_from::<f32>(&[1.0, 2.0], 2).unwrap();
        let b = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], 3).unwrap();
        assert!(matches!(e.add(&a, &b), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_sum_and_broadcast() {
        let mut e = engine();
        let x = e.tensor_from::<f32>(&[1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
        let s = e.sum(&x).unwrap();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.to_scalar_f64(&e).unwrap(), 10.0);
        let b = e.broadcast_to(&s, (2, 2)).unwrap();
        assert_eq!(b.to_f64_vec(&e).unwrap(), vec![10.0; 4]);
    }

    #[test]
    fn test_large_inputs_run_in_parallel_path() {
        let mut e = engine();
        let n = PARALLEL_THRESHOLD + 3;
        let x = e.ones(n, DType::F64).unwrap();
        let y = e.square(&x).unwrap();
        let total = e.sum(&y).unwrap();
        assert_eq!(total.to_scalar_f64(&e).unwrap(), n as f64);
    }

    #[test]
    fn test_reshape_and_identity_share_storage() {
        let mut e = engine();
        let x = e.tensor_from::<f32>(&[1.0, 2.0, 3.0, 4.0], 4).unwrap();
        let r = e.reshape(&x, (2, 2)).unwrap();
        let i = e.identity(&x).unwrap();
        assert_eq!(r.data_id(), x.data_id());
        assert_eq!(i.data_id(), x.data_id());
        assert_eq!(r.dims(), &[2, 2]);
        assert_eq!(e.num_data_buffers(), 1);
        assert_eq!(e.num_tensors(), 3);
    }

    #[test]
    fn test_reshape_rejects_wrong_count() {
        let mut e = engine();
        let x = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], 3).unwrap();
        assert!(matches!(
            e.reshape(&x, (2, 2)),
            Err(Error::ElementCountMismatch { .. })
        ));
    }

    #[test]
    fn test_cast_rounds_to_target() {
        let mut e = engine();
        let x = e.tensor_from::<f32>(&[1.7, -2.2], 2).unwrap();
        let i = e.cast(&x, DType::I32).unwrap();
        assert_eq!(i.dtype(), DType::I32);
        assert_eq!(i.to_f64_vec(&e).unwrap(), vec![1.0, -2.0]);
        let same = e.cast(&x, DType::F32).unwrap();
        assert_eq!(same.data_id(), x.data_id());
    }

    #[test]
    fn test_sum_of_bool_is_i32() {
        let mut e = engine();
        let b = e.make_tensor(vec![true, false, true], 3, DType::Bool, None).unwrap();
        let s = e.sum(&b).unwrap();
        assert_eq!(s.dtype(), DType::I32);
        assert_eq!(s.to_scalar_f64(&e).unwrap(), 2.0);
    }

    #[test]
    fn test_string_tensors_are_not_numeric() {
        let mut e = engine();
        let s = e.make_tensor(vec!["ab", "c"], 2, DType::String, None).unwrap();
        assert!(matches!(e.neg(&s), Err(Error::UnsupportedDType { .. })));
        let mem = e.backend().unwrap().memory();
        assert!(mem.unreliable);
        assert_eq!(mem.num_bytes_in_backend, Some(3));
        assert_eq!(mem.reasons, vec![STRING_REASON.to_string()]);
        assert!(mem.reasons[0].contains("byte length"));
    }

    #[test]
    fn test_complex_counts_two_data_ids() {
        let mut e = engine();
        let values = TensorData::Complex {
            re: vec![1.0, 2.0],
            im: vec![0.0, 1.0],
        };
        let _c = e.make_tensor(values, 2, DType::Complex64, None).unwrap();
        assert_eq!(e.backend().unwrap().num_data_ids(), 2);
    }

    #[test]
    fn test_f16_values_round() {
        let mut e = engine();
        let x = e.tensor_from::<half::f16>(&[half::f16::from_f32(0.1)], ()).unwrap();
        assert_eq!(x.dtype(), DType::F16);
        let v = x.to_scalar_f64(&e).unwrap();
        assert!((v - 0.1).abs() < 1e-3);
    }
}
