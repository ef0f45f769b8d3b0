use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::executor::block_on;
use futures::future::{self, FutureExt, LocalBoxFuture};

use super::*;
use crate::backend::BackendInit;
use crate::data::TensorData;
use crate::dtype::DType;
use crate::error::Error;
use crate::kernel::{Attrs, KernelContext, NamedTensors};
use crate::kernel_names as k;
use crate::shape::Shape;
use crate::storage::DataId;
use crate::tensor::{Tensor, TensorInfo};

// A map-backed backend that records which ids it was asked to release.
#[derive(Default)]
struct MapBackend {
    values: HashMap<DataId, TensorData>,
    released: Rc<RefCell<Vec<DataId>>>,
}

impl Backend for MapBackend {
    fn write(&mut self, id: DataId, values: TensorData, _: &Shape, _: DType) -> Result<()> {
        self.values.insert(id, values);
        Ok(())
    }

    fn read(&self, id: DataId) -> LocalBoxFuture<'static, Result<TensorData>> {
        future::ready(self.read_sync(id)).boxed_local()
    }

    fn read_sync(&self, id: DataId) -> Result<TensorData> {
        self.values
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::UnknownDataId(id.to_string()))
    }

    fn dispose_data(&mut self, id: DataId, _force: bool) -> bool {
        self.released.borrow_mut().push(id);
        self.values.remove(&id);
        true
    }

    fn num_data_ids(&self) -> usize {
        self.values.len()
    }

    fn move_data(&mut self, id: DataId, values: TensorData, _: &Shape, _: DType, _: usize) -> Result<()> {
        self.values.insert(id, values);
        Ok(())
    }
}

fn negate(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    let x = ctx.input("x")?.clone();
    let values: Vec<f64> = ctx.read(&x)?.into_f64_vec()?.iter().map(|v| -v).collect();
    Ok(vec![ctx.alloc(TensorData::Numeric(values), x.shape, x.dtype)?])
}

fn engine_with(released: Rc<RefCell<Vec<DataId>>>) -> Engine {
    let mut engine = Engine::new(EngineConfig::new().with_leak_checks(true));
    engine.register_backend(
        "map",
        move || {
            Ok(BackendInit::ready(MapBackend {
                values: HashMap::new(),
                released: released.clone(),
            }))
        },
        1,
    );
    engine.register_kernel(KernelConfig::new(k::NEG, "map", negate));
    engine
}

fn engine() -> Engine {
    engine_with(Rc::default())
}

#[test]
fn test_backend_resolved_on_first_use() {
    let mut e = engine();
    assert!(e.backend_name().is_none());
    let x = e.tensor_from::<f32>(&[1.0], ()).unwrap();
    assert_eq!(e.backend_name(), Some("map"));
    assert_eq!(e.owner_of(&x).unwrap(), "map");
}

#[test]
fn test_release_happens_at_last_reference() {
    let released = Rc::new(RefCell::new(Vec::new()));
    let mut e = engine_with(released.clone());
    let x = e.tensor_from::<f32>(&[1.0, 2.0], 2).unwrap();
    let y = e.clone_tensor(&x).unwrap();
    e.dispose_tensor(&x);
    assert!(released.borrow().is_empty());
    e.dispose_tensor(&y);
    assert_eq!(released.borrow().as_slice(), &[x.data_id()]);
    assert_eq!(e.memory().num_bytes, 0);
}

#[test]
fn test_kernel_dispatch_and_tidy() {
    let mut e = engine();
    let x = e.tensor_from::<f64>(&[1.0, -2.0], 2).unwrap();
    let y = e
        .tidy("double-neg", |e| {
            let a = e.neg(&x)?;
            e.neg(&a)
        })
        .unwrap();
    assert_eq!(e.read_sync(&y).unwrap(), TensorData::Numeric(vec![1.0, -2.0]));
    assert_eq!(e.num_tensors(), 2);
    assert_eq!(e.num_data_buffers(), 2);
}

#[test]
fn test_missing_kernel() {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0], ()).unwrap();
    let err = e.square(&x).unwrap_err();
    assert!(matches!(err, Error::KernelNotFound { ref backend, .. } if backend == "map"));
}

#[test]
fn test_kernel_missing_input() {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0], ()).unwrap();
    let inputs = NamedTensors::new().with("input", &x);
    let err = e.run_kernel(k::NEG, &inputs, &Attrs::new()).unwrap_err();
    assert!(matches!(err, Error::MissingKernelInput { .. }));
    assert_eq!(e.num_tensors(), 1);
}

#[test]
fn test_gradient_through_registered_kernel() {
    let mut e = engine();
    let x = e.tensor_from::<f64>(&[3.0], ()).unwrap();
    let result = e.gradients(|e| e.neg(&x), &[x.clone()], None, false).unwrap();
    let grad = result.grads[0].as_ref().unwrap();
    assert_eq!(e.read_sync(grad).unwrap(), TensorData::Numeric(vec![-1.0]));
}

#[test]
fn test_ready_awaits_async_factory() {
    let mut e = Engine::default();
    e.register_backend(
        "later",
        || {
            Ok(BackendInit::pending(async {
                Ok(Box::new(MapBackend::default()) as Box<dyn Backend>)
            }))
        },
        1,
    );
    assert!(matches!(e.backend(), Err(Error::BackendNotInitialized(_))));
    block_on(e.ready()).unwrap();
    assert_eq!(e.backend_name(), Some("later"));
    assert!(e.backend().is_ok());
}

#[test]
fn test_reset_disposes_scoped_and_variable_handles() {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0], ()).unwrap();
    let w = e.make_variable(&x, true, Some("w"), None).unwrap();
    e.start_scope("open");
    let inner = e.tensor_from::<f32>(&[2.0], ()).unwrap();
    e.reset();
    assert!(w.is_disposed());
    assert!(inner.is_disposed());
    assert_eq!(e.scope_depth(), 0);
    assert_eq!(e.storage().num_live(), 0);
}

#[test]
fn test_string_memory_is_unreliable() {
    let mut e = engine();
    let s = e.make_tensor(vec!["abc"], 1, DType::String, None).unwrap();
    let mem = e.memory();
    assert!(mem.unreliable);
    assert_eq!(mem.reasons, vec![STRING_MEMORY_REASON.to_string()]);
    assert_eq!(mem.num_bytes, 3);
    e.dispose_tensor(&s);
    assert!(!e.memory().unreliable);
}

#[test]
fn test_inc_ref_adds_a_handle_without_writing() {
    let released = Rc::new(RefCell::new(Vec::new()));
    let mut e = engine_with(released.clone());
    let x = e.tensor_from::<f32>(&[7.0], ()).unwrap();
    let alias = Tensor::new(x.data_id(), x.shape().clone(), x.dtype());
    e.inc_ref(&alias, "map").unwrap();
    assert_eq!(e.num_tensors(), 2);
    assert_eq!(e.num_data_buffers(), 1);
    assert_eq!(e.storage().get(x.data_id()).map(|r| r.ref_count), Some(2));
    e.dispose_tensor(&x);
    assert!(released.borrow().is_empty());
    e.dispose_tensor(&alias);
    assert_eq!(released.borrow().len(), 1);
}

#[test]
fn test_inc_ref_on_a_tracked_handle_is_a_no_op() {
    let released = Rc::new(RefCell::new(Vec::new()));
    let mut e = engine_with(released.clone());
    let x = e.tensor_from::<f32>(&[7.0], ()).unwrap();
    e.inc_ref(&x, "map").unwrap();
    assert_eq!(e.num_tensors(), 1);
    assert_eq!(e.storage().get(x.data_id()).map(|r| r.ref_count), Some(1));
    e.dispose_tensor(&x);
    assert_eq!(e.num_tensors(), 0);
    assert_eq!(e.num_data_buffers(), 0);
    assert_eq!(released.borrow().len(), 1);
}
