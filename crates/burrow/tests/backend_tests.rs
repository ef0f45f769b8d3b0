// Integration tests for backend registration, selection and initialization
//
// Several CPU backends are registered under different names and
// priorities; factories are wrapped to fail or to initialize
// asynchronously on demand.

use std::cell::Cell;
use std::rc::Rc;

use futures::executor::block_on;

use burrow::cpu::{self, CpuBackend};
use burrow::prelude::*;
use burrow::{Backend, BackendInit, InitOutcome};

fn flaky_factory(fail: Rc<Cell<bool>>) -> impl Fn() -> burrow::Result<BackendInit> {
    move || {
        if fail.get() {
            Err(Error::msg("device lost"))
        } else {
            Ok(BackendInit::ready(CpuBackend::new()))
        }
    }
}

fn async_factory() -> burrow::Result<BackendInit> {
    Ok(BackendInit::pending(async {
        Ok(Box::new(CpuBackend::new()) as Box<dyn Backend>)
    }))
}

#[test]
fn test_highest_priority_wins() -> burrow::Result<()> {
    let mut e = Engine::default();
    cpu::register_as(&mut e, "slow", 1);
    cpu::register_as(&mut e, "fast", 2);
    assert_eq!(e.sorted_backends()?, vec!["fast".to_string(), "slow".to_string()]);
    let x = e.tensor_from::<f32>(&[1.0], ())?;
    assert_eq!(e.backend_name(), Some("fast"));
    assert_eq!(e.owner_of(&x)?, "fast");
    Ok(())
}

#[test]
fn test_equal_priority_keeps_registration_order() -> burrow::Result<()> {
    let mut e = Engine::default();
    cpu::register_as(&mut e, "zeta", 1);
    cpu::register_as(&mut e, "alpha", 1);
    assert_eq!(e.sorted_backends()?, vec!["zeta".to_string(), "alpha".to_string()]);
    Ok(())
}

#[test]
fn test_duplicate_registration_is_refused() {
    let mut e = Engine::default();
    assert!(cpu::register(&mut e, 1));
    assert!(!cpu::register(&mut e, 5));
    assert_eq!(e.backend_priority("cpu"), Some(1));
}

#[test]
fn test_no_backends_registered() {
    let mut e = Engine::default();
    let err = e.tensor_from::<f32>(&[1.0], ()).unwrap_err();
    assert!(matches!(err, Error::NoBackendsRegistered));
}

#[test]
fn test_all_factories_failing() {
    let mut e = Engine::default();
    let fail = Rc::new(Cell::new(true));
    e.register_backend("broken", flaky_factory(fail), 1);
    assert!(matches!(block_on(e.ready()), Err(Error::NoBackendAvailable)));
    assert!(matches!(e.backend(), Err(Error::NoBackendAvailable)));
}

#[test]
fn test_fallback_after_reset() -> burrow::Result<()> {
    let mut e = Engine::default();
    let fail = Rc::new(Cell::new(false));
    e.register_backend("fast", flaky_factory(fail.clone()), 2);
    cpu::register_cpu_kernels(e.kernel_registry_mut(), "fast");
    cpu::register_as(&mut e, "slow", 1);

    block_on(e.ready())?;
    assert_eq!(e.backend_name(), Some("fast"));

    e.reset();
    fail.set(true);
    block_on(e.ready())?;
    assert_eq!(e.backend_name(), Some("slow"));

    let x = e.tensor_from::<f32>(&[2.0], ())?;
    let y = e.square(&x)?;
    assert_eq!(y.to_scalar_f64(&e)?, 4.0);
    Ok(())
}

#[test]
fn test_set_backend() -> burrow::Result<()> {
    let mut e = Engine::default();
    cpu::register_as(&mut e, "a", 2);
    cpu::register_as(&mut e, "b", 1);
    assert!(block_on(e.set_backend("b"))?);
    assert_eq!(e.backend_name(), Some("b"));
    assert!(matches!(
        block_on(e.set_backend("missing")),
        Err(Error::BackendNotFound(_))
    ));

    let fail = Rc::new(Cell::new(true));
    e.register_backend("broken", flaky_factory(fail), 3);
    assert!(!block_on(e.set_backend("broken"))?);
    assert_eq!(e.backend_name(), Some("b"));
    Ok(())
}

#[test]
fn test_find_backend_instantiates_lazily() {
    let mut e = Engine::default();
    cpu::register(&mut e, 1);
    assert!(e.backend_names().is_empty());
    assert!(e.find_backend("cpu").is_some());
    assert_eq!(e.backend_names(), vec!["cpu".to_string()]);
    assert!(e.find_backend("nope").is_none());
    assert!(e.backend_name().is_none());
}

#[test]
fn test_data_moves_to_active_backend() -> burrow::Result<()> {
    let mut e = Engine::new(EngineConfig::new().with_leak_checks(true));
    cpu::register_as(&mut e, "a", 2);
    cpu::register_as(&mut e, "b", 1);
    let x = e.make_tensor(vec![1.0f64, 2.0], 2, DType::F32, Some("b"))?;
    assert_eq!(e.owner_of(&x)?, "b");

    let y = e.add(&x, &x)?;
    assert_eq!(e.backend_name(), Some("a"));
    assert_eq!(e.owner_of(&x)?, "a");
    assert_eq!(e.owner_of(&y)?, "a");
    assert_eq!(x.to_f64_vec(&e)?, vec![1.0, 2.0]);
    assert_eq!(y.to_f64_vec(&e)?, vec![2.0, 4.0]);
    assert_eq!(e.find_backend("b").map(|b| b.num_data_ids()), Some(0));
    Ok(())
}

#[test]
fn test_explicit_move_keeps_refcount() -> burrow::Result<()> {
    let mut e = Engine::default();
    cpu::register_as(&mut e, "a", 2);
    cpu::register_as(&mut e, "b", 1);
    let x = e.tensor_from::<f32>(&[3.0], ())?;
    let x2 = e.clone_tensor(&x)?;
    e.move_data(x.data_id(), "b")?;
    assert_eq!(e.owner_of(&x2)?, "b");
    assert_eq!(e.storage().get(x.data_id()).map(|r| r.ref_count), Some(2));
    e.dispose_tensor(&x);
    e.dispose_tensor(&x2);
    assert_eq!(e.find_backend("b").map(|b| b.num_data_ids()), Some(0));
    Ok(())
}

#[test]
fn test_remove_active_backend() -> burrow::Result<()> {
    let mut e = Engine::default();
    cpu::register_as(&mut e, "a", 2);
    cpu::register_as(&mut e, "b", 1);
    let _x = e.tensor_from::<f32>(&[1.0], ())?;
    assert_eq!(e.backend_name(), Some("a"));
    e.remove_backend("a")?;
    assert!(e.backend_name().is_none());
    assert_eq!(e.registered_backend_names(), vec!["b".to_string()]);
    let _y = e.tensor_from::<f32>(&[1.0], ())?;
    assert_eq!(e.backend_name(), Some("b"));
    assert!(matches!(e.remove_backend("a"), Err(Error::BackendNotFound(_))));
    Ok(())
}

#[test]
fn test_async_backend_needs_ready() -> burrow::Result<()> {
    let mut e = Engine::default();
    e.register_backend("gpu", async_factory, 3);
    cpu::register_cpu_kernels(e.kernel_registry_mut(), "gpu");

    let err = e.tensor_from::<f32>(&[1.0], ()).unwrap_err();
    assert!(matches!(err, Error::BackendNotInitialized(ref name) if name == "gpu"));

    block_on(e.ready())?;
    assert_eq!(e.backend_name(), Some("gpu"));
    let x = e.tensor_from::<f32>(&[1.0, 2.0], 2)?;
    let y = e.neg(&x)?;
    assert_eq!(y.to_f64_vec(&e)?, vec![-1.0, -2.0]);
    Ok(())
}

#[test]
fn test_stale_async_init_is_discarded() -> burrow::Result<()> {
    let mut e = Engine::default();
    e.register_backend("gpu", async_factory, 2);
    cpu::register_cpu_kernels(e.kernel_registry_mut(), "gpu");
    cpu::register(&mut e, 1);

    let first = e.initialize_backend("gpu")?;
    assert!(matches!(first, InitOutcome::Pending { .. }));
    let stale = e.take_pending_init().expect("an init should be pending");

    e.reset();
    block_on(e.ready())?;
    assert_eq!(e.backend_name(), Some("gpu"));
    let x = e.tensor_from::<f32>(&[5.0], ())?;

    let result = block_on(stale.future);
    assert!(!e.complete_initialization(&stale.name, stale.init_id, result));
    assert_eq!(e.backend_name(), Some("gpu"));
    assert_eq!(x.to_f64_vec(&e)?, vec![5.0]);
    Ok(())
}

#[test]
fn test_switching_backend_cancels_pending_init() -> burrow::Result<()> {
    let mut e = Engine::default();
    e.register_backend("gpu", async_factory, 2);
    cpu::register_cpu_kernels(e.kernel_registry_mut(), "gpu");
    cpu::register(&mut e, 1);

    e.initialize_backend("gpu")?;
    let stale = e.take_pending_init().expect("an init should be pending");

    assert!(block_on(e.set_backend("cpu"))?);
    assert_eq!(e.backend_name(), Some("cpu"));
    let x = e.tensor_from::<f32>(&[2.0], ())?;
    assert_eq!(e.owner_of(&x)?, "cpu");

    let result = block_on(stale.future);
    assert!(!e.complete_initialization(&stale.name, stale.init_id, result));
    assert_eq!(e.backend_name(), Some("cpu"));
    assert_eq!(x.to_f64_vec(&e)?, vec![2.0]);
    Ok(())
}

#[test]
fn test_memory_includes_backend_stats() -> burrow::Result<()> {
    let mut e = Engine::default();
    cpu::register(&mut e, 1);
    let _x = e.tensor_from::<f64>(&[1.0, 2.0], 2)?;
    let mem = e.memory();
    assert_eq!(mem.num_bytes, 16);
    assert_eq!(mem.backend.num_bytes_in_backend, Some(16));
    Ok(())
}
