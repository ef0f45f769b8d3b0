// Integration tests for the engine's bookkeeping
//
// Storage tracking, scopes, variables, memory accounting, reset and
// profiling, all exercised against the CPU backend.

use std::cell::Cell;
use std::rc::Rc;

use approx::assert_abs_diff_eq;
use burrow::prelude::*;
use burrow::{cpu, KernelConfig, KernelContext, TensorInfo};

fn engine() -> Engine {
    let mut engine = Engine::new(EngineConfig::new().with_leak_checks(true));
    cpu::register(&mut engine, 1);
    engine
}

fn assert_vec_approx(got: &[f64], expected: &[f64]) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (g, e) in got.iter().zip(expected) {
        assert_abs_diff_eq!(*g, *e, epsilon = 1e-6);
    }
}

// Tracker

#[test]
fn test_make_tensor_is_tracked() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], 3)?;
    let mem = e.memory();
    assert_eq!(mem.num_tensors, 1);
    assert_eq!(mem.num_data_buffers, 1);
    assert_eq!(mem.num_bytes, 12);
    assert!(!mem.unreliable);
    assert_eq!(e.owner_of(&x)?, "cpu");
    assert_eq!(x.to_f64_vec(&e)?, vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn test_values_must_match_shape() {
    let mut e = engine();
    let err = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], (2, 2)).unwrap_err();
    assert!(matches!(err, Error::ElementCountMismatch { expected: 4, got: 3, .. }));
    assert_eq!(e.num_tensors(), 0);
    assert_eq!(e.num_data_buffers(), 0);
}

#[test]
fn test_dispose_is_idempotent() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0], ())?;
    x.dispose(&mut e);
    x.dispose(&mut e);
    assert!(x.is_disposed());
    assert_eq!(e.num_tensors(), 0);
    assert_eq!(e.num_data_buffers(), 0);
    assert_eq!(e.memory().num_bytes, 0);
    assert!(matches!(e.read_sync(&x), Err(Error::TensorDisposed(_))));
    assert!(matches!(e.neg(&x), Err(Error::TensorDisposed(_))));
    Ok(())
}

#[test]
fn test_clone_shares_storage_until_last_handle() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f64>(&[4.0, 5.0], 2)?;
    let y = e.clone_tensor(&x)?;
    assert_ne!(x.id(), y.id());
    assert_eq!(x.data_id(), y.data_id());
    assert_eq!(e.num_tensors(), 2);
    assert_eq!(e.num_data_buffers(), 1);
    assert_eq!(e.storage().get(x.data_id()).map(|r| r.ref_count), Some(2));

    e.dispose_tensor(&x);
    assert_eq!(e.num_data_buffers(), 1);
    assert_eq!(y.to_f64_vec(&e)?, vec![4.0, 5.0]);

    e.dispose_tensor(&y);
    assert_eq!(e.num_data_buffers(), 0);
    Ok(())
}

#[test]
fn test_dispose_container() -> burrow::Result<()> {
    let mut e = engine();
    let a = e.tensor_from::<f32>(&[1.0], ())?;
    let b = e.tensor_from::<f32>(&[2.0], ())?;
    let c = e.tensor_from::<f32>(&[3.0], ())?;
    e.dispose(&(vec![a.clone(), b.clone()], Some(c.clone())));
    assert!(a.is_disposed() && b.is_disposed() && c.is_disposed());
    assert_eq!(e.num_tensors(), 0);
    Ok(())
}

#[test]
fn test_read_async_matches_sync() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.5, -2.0], 2)?;
    let sync = e.read_sync(&x)?;
    let via_future = futures::executor::block_on(e.read(&x))?;
    assert_eq!(sync, via_future);
    Ok(())
}

// Scopes

#[test]
fn test_tidy_disposes_intermediates() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0], 2)?;
    let before = e.num_tensors();
    let y = e.tidy("square-sum", |e| {
        let a = e.add(&x, &x)?;
        let b = e.mul(&a, &a)?;
        e.sum(&b)
    })?;
    assert_eq!(e.num_tensors(), before + 1);
    assert_eq!(e.num_data_buffers(), 2);
    assert_abs_diff_eq!(y.to_scalar_f64(&e)?, 20.0);
    assert_eq!(e.scope_depth(), 0);
    Ok(())
}

#[test]
fn test_tidy_keeps_kept_tensors() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[2.0], ())?;
    let mut kept = None;
    e.tidy("keep", |e| {
        let a = e.square(&x)?;
        kept = Some(e.keep(&a));
        let _scratch = e.neg(&a)?;
        Ok(())
    })?;
    let kept = kept.unwrap();
    assert!(!kept.is_disposed());
    assert!(kept.is_kept());
    assert_abs_diff_eq!(kept.to_scalar_f64(&e)?, 4.0);
    assert_eq!(e.num_tensors(), 2);
    Ok(())
}

#[test]
fn test_tidy_error_path_ends_scope() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0], 2)?;
    let y = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], 3)?;
    let result = e.tidy("failing", |e| {
        let _a = e.neg(&x)?;
        e.add(&x, &y)
    });
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    assert_eq!(e.scope_depth(), 0);
    assert_eq!(e.num_tensors(), 2);
    Ok(())
}

#[test]
fn test_nested_scopes_return_through_every_level() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f64>(&[3.0], ())?;
    let out = e.tidy("outer", |e| {
        let inner = e.tidy("inner", |e| {
            assert_eq!(e.active_scope_name(), Some("inner"));
            let a = e.square(&x)?;
            e.neg(&a)
        })?;
        assert_eq!(e.scope_depth(), 1);
        let _unused = e.add(&inner, &inner)?;
        Ok(inner)
    })?;
    assert_eq!(e.num_tensors(), 2);
    assert_abs_diff_eq!(out.to_scalar_f64(&e)?, -9.0);
    Ok(())
}

#[test]
fn test_manual_scope() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0], ())?;
    e.start_scope("manual");
    let a = e.neg(&x)?;
    let b = e.neg(&a)?;
    e.end_scope(&b)?;
    assert!(a.is_disposed());
    assert!(!b.is_disposed());
    assert!(e.end_scope(&()).is_err());
    Ok(())
}

#[test]
fn test_scope_conserves_outer_tensors() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], 3)?;
    let before = e.memory();
    e.tidy("noop", |e| {
        let a = e.clone_tensor(&x)?;
        let b = e.reshape(&a, (3, 1))?;
        let _c = e.identity(&b)?;
        Ok(())
    })?;
    let after = e.memory();
    assert_eq!(before.num_tensors, after.num_tensors);
    assert_eq!(before.num_data_buffers, after.num_data_buffers);
    assert_eq!(before.num_bytes, after.num_bytes);
    assert_eq!(e.storage().get(x.data_id()).map(|r| r.ref_count), Some(1));
    Ok(())
}

// Variables

#[test]
fn test_variable_shares_initial_storage() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0], 2)?;
    let w = e.make_variable(&x, true, Some("w"), None)?;
    assert!(w.is_variable());
    assert_eq!(w.name(), "w");
    assert_eq!(w.data_id(), x.data_id());
    assert_eq!(e.num_tensors(), 2);
    assert_eq!(e.num_data_buffers(), 1);
    assert_eq!(e.registered_variables().len(), 1);
    Ok(())
}

#[test]
fn test_variable_duplicate_name() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0], ())?;
    e.make_variable(&x, true, Some("w"), None)?;
    let err = e.make_variable(&x, true, Some("w"), None).unwrap_err();
    assert!(matches!(err, Error::DuplicateVariableName(name) if name == "w"));
    Ok(())
}

#[test]
fn test_variable_generated_names_are_unique() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0], ())?;
    let a = e.make_variable(&x, false, None, None)?;
    let b = e.make_variable(&x, false, None, None)?;
    assert_ne!(a.name(), b.name());
    assert!(!a.trainable());
    Ok(())
}

#[test]
fn test_variable_assign_round_trip() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0], 2)?;
    let w = e.make_variable(&x, true, Some("w"), None)?;
    let v = e.tensor_from::<f32>(&[7.0, 8.0], 2)?;
    w.assign(&mut e, &v)?;
    assert_eq!(w.data_id(), v.data_id());
    assert_eq!(w.to_f64_vec(&e)?, vec![7.0, 8.0]);
    assert_eq!(x.to_f64_vec(&e)?, vec![1.0, 2.0]);

    e.dispose_tensor(&v);
    assert_eq!(w.to_f64_vec(&e)?, vec![7.0, 8.0]);

    let wrong = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], 3)?;
    assert!(matches!(w.assign(&mut e, &wrong), Err(Error::ShapeMismatch { .. })));
    let wrong_dtype = e.tensor_from::<f64>(&[1.0, 2.0], 2)?;
    assert!(matches!(
        w.assign(&mut e, &wrong_dtype),
        Err(Error::DTypeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_variable_survives_tidy() -> burrow::Result<()> {
    let mut e = engine();
    let var = e.tidy("init", |e| {
        let x = e.tensor_from::<f32>(&[5.0], ())?;
        let w = e.make_variable(&x, true, Some("w"), None)?;
        Ok(w.tensor().clone())
    })?;
    assert!(!var.is_disposed());
    let w = e.variable("w").cloned().unwrap();
    assert_abs_diff_eq!(w.to_scalar_f64(&e)?, 5.0);
    assert_eq!(e.num_tensors(), 1);

    e.dispose(&w);
    assert!(e.variable("w").is_none());
    assert_eq!(e.num_tensors(), 0);
    assert_eq!(e.num_data_buffers(), 0);
    Ok(())
}

#[test]
fn test_variable_with_dtype_casts() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.9], ())?;
    let w = e.make_variable(&x, true, Some("w"), Some(DType::I32))?;
    assert_eq!(w.dtype(), DType::I32);
    assert_ne!(w.data_id(), x.data_id());
    assert_abs_diff_eq!(w.to_scalar_f64(&e)?, 1.0);
    Ok(())
}

// Memory and reset

#[test]
fn test_memory_strings_are_unreliable() -> burrow::Result<()> {
    let mut e = engine();
    let s = e.make_tensor(vec!["hello", "a"], 2, DType::String, None)?;
    let mem = e.memory();
    assert!(mem.unreliable);
    assert!(mem.reasons.iter().any(|r| r == burrow::STRING_MEMORY_REASON));
    assert_eq!(mem.num_bytes, 6);

    e.dispose_tensor(&s);
    assert!(!e.memory().unreliable);
    Ok(())
}

#[test]
fn test_reset_clears_everything() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0], 2)?;
    let _w = e.make_variable(&x, true, Some("w"), None)?;
    e.reset();

    let mem = e.memory();
    assert_eq!(mem.num_tensors, 0);
    assert_eq!(mem.num_data_buffers, 0);
    assert_eq!(mem.num_bytes, 0);
    assert!(e.registered_variables().is_empty());
    assert!(e.backend_name().is_none());
    assert!(e.read_sync(&x).is_err());

    let y = e.tensor_from::<f32>(&[3.0], ())?;
    assert_eq!(e.backend_name(), Some("cpu"));
    assert_abs_diff_eq!(y.to_scalar_f64(&e)?, 3.0);
    assert_eq!(e.num_tensors(), 1);
    Ok(())
}

// Dispatch checks

fn leaky_double(ctx: &mut KernelContext<'_>) -> burrow::Result<Vec<TensorInfo>> {
    let x = ctx.input("x")?.clone();
    let values: Vec<f64> = ctx.read(&x)?.into_f64_vec()?.iter().map(|v| v * 2.0).collect();
    let _scratch = ctx.alloc(TensorData::Numeric(values.clone()), x.shape.clone(), x.dtype)?;
    let out = ctx.alloc(TensorData::Numeric(values), x.shape, x.dtype)?;
    Ok(vec![out])
}

#[test]
fn test_leak_check_catches_dropped_allocation() -> burrow::Result<()> {
    let mut e = engine();
    e.register_kernel(KernelConfig::new("LeakyDouble", "cpu", leaky_double));
    let x = e.tensor_from::<f32>(&[1.0], ())?;
    let inputs = burrow::NamedTensors::new().with("x", &x);
    let err = e
        .run_kernel("LeakyDouble", &inputs, &burrow::Attrs::new())
        .unwrap_err();
    assert!(matches!(err, Error::BackendMemoryLeak { leaked: 1, .. }));

    e.set_config(EngineConfig::new());
    let out = e.run_kernel("LeakyDouble", &inputs, &burrow::Attrs::new())?.into_single()?;
    assert_abs_diff_eq!(out.to_scalar_f64(&e)?, 2.0);
    Ok(())
}

#[test]
fn test_leak_check_passes_for_builtin_kernels() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0], 2)?;
    let two = e.scalar(2.0, DType::F32)?;
    let y = e.mul(&x, &two)?;
    let z = e.reshape(&y, (2, 1))?;
    let s = e.sum(&z)?;
    let b = e.broadcast_to(&s, 3)?;
    let c = e.cast(&b, DType::F64)?;
    assert_vec_approx(&c.to_f64_vec(&e)?, &[6.0, 6.0, 6.0]);
    Ok(())
}

#[test]
fn test_unknown_kernel() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0], ())?;
    let err = e
        .run_kernel("Atan2", &burrow::NamedTensors::new().with("x", &x), &burrow::Attrs::new())
        .unwrap_err();
    assert!(matches!(err, Error::KernelNotFound { ref kernel, .. } if kernel == "Atan2"));
    Ok(())
}

#[test]
fn test_debug_mode_rejects_nan() -> burrow::Result<()> {
    let mut e = Engine::new(EngineConfig::new().with_debug(true));
    cpu::register(&mut e, 1);
    let x = e.tensor_from::<f64>(&[f64::INFINITY], ())?;
    assert!(matches!(e.sub(&x, &x), Err(Error::NanInKernelOutput(ref k)) if k == "Sub"));
    Ok(())
}

fn noop(ctx: &mut KernelContext<'_>) -> burrow::Result<Vec<TensorInfo>> {
    Ok(vec![ctx.input("x")?.clone()])
}

#[test]
fn test_setup_hook_runs_on_activation() -> burrow::Result<()> {
    let mut e = engine();
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    e.register_kernel(
        KernelConfig::new("Noop", "cpu", noop).with_setup(move |_| counter.set(counter.get() + 1)),
    );
    let _x = e.tensor_from::<f32>(&[1.0], ())?;
    assert_eq!(calls.get(), 1);
    e.reset();
    let _y = e.tensor_from::<f32>(&[1.0], ())?;
    assert_eq!(calls.get(), 2);
    Ok(())
}

// Profiling

#[test]
fn test_profile_records_kernels() -> burrow::Result<()> {
    let mut e = engine();
    let x = e.tensor_from::<f32>(&[1.0, 2.0, 3.0], 3)?;
    let (total, info) = e.profile(|e| {
        let sq = e.square(&x)?;
        e.sum(&sq)
    })?;
    assert_abs_diff_eq!(total.to_scalar_f64(&e)?, 14.0);
    assert_eq!(info.kernel_names(), vec!["Square", "Sum"]);
    assert_eq!(info.new_tensors, 2);
    assert_eq!(info.new_bytes, 16);
    assert!(info.peak_bytes >= 28);
    assert_eq!(info.kernels[0].output_shapes[0].dims(), &[3]);
    assert!(info.report().to_string().contains("Square"));
    Ok(())
}
