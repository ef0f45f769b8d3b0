// CPU kernels
//
// Every kernel reads its inputs through the KernelContext, computes in f64
// and allocates outputs with `ctx.alloc`, which rounds to the output dtype.
// Element-wise loops switch to rayon above PARALLEL_THRESHOLD elements.
//
// Kernels that do not change values (Identity, Reshape, same-dtype Cast,
// same-shape BroadcastTo) return their input's DataId instead of copying;
// the Engine tracks the result as one more reference to that storage.

use rayon::prelude::*;

use burrow_core::data::TensorData;
use burrow_core::dtype::DType;
use burrow_core::error::{Error, Result};
use burrow_core::kernel::{KernelConfig, KernelContext, KernelRegistry};
use burrow_core::kernel_names as k;
use burrow_core::shape::Shape;
use burrow_core::tensor::TensorInfo;

/// Element count above which element-wise loops run on the rayon pool.
pub const PARALLEL_THRESHOLD: usize = 1 << 14;

/// Register every CPU kernel under `backend_name`.
pub fn register_cpu_kernels(registry: &mut KernelRegistry, backend_name: &str) {
    registry.register_kernel(KernelConfig::new(k::ADD, backend_name, add));
    registry.register_kernel(KernelConfig::new(k::SUB, backend_name, sub));
    registry.register_kernel(KernelConfig::new(k::MUL, backend_name, mul));
    registry.register_kernel(KernelConfig::new(k::NEG, backend_name, neg));
    registry.register_kernel(KernelConfig::new(k::SQUARE, backend_name, square));
    registry.register_kernel(KernelConfig::new(k::SUM, backend_name, sum));
    registry.register_kernel(KernelConfig::new(k::BROADCAST_TO, backend_name, broadcast_to));
    registry.register_kernel(KernelConfig::new(k::CAST, backend_name, cast));
    registry.register_kernel(KernelConfig::new(k::IDENTITY, backend_name, identity));
    registry.register_kernel(KernelConfig::new(k::RESHAPE, backend_name, reshape));
}

// ---- Helpers ----

fn check_numeric(kernel: &str, dtype: DType) -> Result<()> {
    if !dtype.is_numeric() {
        return Err(Error::UnsupportedDType {
            op: kernel.to_string(),
            dtype,
        });
    }
    Ok(())
}

/// Read a numeric input by name.
fn numeric_input(ctx: &KernelContext<'_>, name: &str) -> Result<(TensorInfo, Vec<f64>)> {
    let info = ctx.input(name)?.clone();
    check_numeric(ctx.kernel_name(), info.dtype)?;
    let values = ctx.read(&info)?.into_f64_vec()?;
    Ok((info, values))
}

fn map_values(values: &[f64], f: impl Fn(f64) -> f64 + Sync + Send) -> Vec<f64> {
    if values.len() >= PARALLEL_THRESHOLD {
        values.par_iter().map(|&v| f(v)).collect()
    } else {
        values.iter().map(|&v| f(v)).collect()
    }
}

fn zip_values(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64 + Sync + Send) -> Vec<f64> {
    if a.len() >= PARALLEL_THRESHOLD {
        a.par_iter().zip(b.par_iter()).map(|(&x, &y)| f(x, y)).collect()
    } else {
        a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
    }
}

/// Element-wise binary op over equal shapes, or with a scalar on either side.
fn binary(ctx: &mut KernelContext<'_>, f: impl Fn(f64, f64) -> f64 + Sync + Send) -> Result<Vec<TensorInfo>> {
    let (a, av) = numeric_input(ctx, "a")?;
    let (b, bv) = numeric_input(ctx, "b")?;
    if a.dtype != b.dtype {
        return Err(Error::DTypeMismatch {
            expected: a.dtype,
            got: b.dtype,
        });
    }

    let (shape, values) = if a.shape == b.shape {
        (a.shape.clone(), zip_values(&av, &bv, f))
    } else if b.shape.elem_count() == 1 {
        let y = bv[0];
        (a.shape.clone(), map_values(&av, |x| f(x, y)))
    } else if a.shape.elem_count() == 1 {
        let x = av[0];
        (b.shape.clone(), map_values(&bv, |y| f(x, y)))
    } else {
        return Err(Error::ShapeMismatch {
            expected: a.shape.clone(),
            got: b.shape.clone(),
        });
    };
    let out = ctx.alloc(TensorData::Numeric(values), shape, a.dtype)?;
    Ok(vec![out])
}

fn unary(ctx: &mut KernelContext<'_>, f: impl Fn(f64) -> f64 + Sync + Send) -> Result<Vec<TensorInfo>> {
    let (x, xv) = numeric_input(ctx, "x")?;
    let out = ctx.alloc(TensorData::Numeric(map_values(&xv, f)), x.shape, x.dtype)?;
    Ok(vec![out])
}

// ---- Kernels ----

fn add(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    binary(ctx, |a, b| a + b)
}

fn sub(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    binary(ctx, |a, b| a - b)
}

fn mul(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    binary(ctx, |a, b| a * b)
}

fn neg(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    unary(ctx, |x| -x)
}

fn square(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    unary(ctx, |x| x * x)
}

/// Sum of all elements. Bool inputs sum to i32.
fn sum(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    let (x, xv) = numeric_input(ctx, "x")?;
    let total: f64 = if xv.len() >= PARALLEL_THRESHOLD {
        xv.par_iter().sum()
    } else {
        xv.iter().sum()
    };
    let dtype = match x.dtype {
        DType::Bool => DType::I32,
        d => d,
    };
    let out = ctx.alloc(TensorData::Numeric(vec![total]), Shape::scalar(), dtype)?;
    Ok(vec![out])
}

fn broadcast_to(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    let shape = ctx.attrs().shape(k::BROADCAST_TO, "shape")?;
    let x = ctx.input("x")?.clone();
    if x.shape == shape {
        return Ok(vec![x]);
    }
    if x.shape.elem_count() != 1 {
        return Err(Error::ShapeMismatch {
            expected: shape,
            got: x.shape,
        });
    }
    let values = ctx.read(&x)?;
    let filled = match values {
        TensorData::Numeric(v) => TensorData::Numeric(vec![v[0]; shape.elem_count()]),
        TensorData::Complex { re, im } => TensorData::Complex {
            re: vec![re[0]; shape.elem_count()],
            im: vec![im[0]; shape.elem_count()],
        },
        TensorData::Strings(v) => TensorData::Strings(vec![v[0].clone(); shape.elem_count()]),
    };
    let out = ctx.alloc(filled, shape, x.dtype)?;
    Ok(vec![out])
}

fn cast(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    let dtype = ctx.attrs().dtype(k::CAST, "dtype")?;
    let x = ctx.input("x")?.clone();
    if x.dtype == dtype {
        return Ok(vec![x]);
    }
    check_numeric(k::CAST, x.dtype)?;
    check_numeric(k::CAST, dtype)?;
    let values = ctx.read(&x)?;
    let out = ctx.alloc(values, x.shape, dtype)?;
    Ok(vec![out])
}

fn identity(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    Ok(vec![ctx.input("x")?.clone()])
}

fn reshape(ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
    let shape = ctx.attrs().shape(k::RESHAPE, "shape")?;
    let x = ctx.input("x")?.clone();
    let expected = shape.elem_count();
    if expected != x.shape.elem_count() {
        return Err(Error::ElementCountMismatch {
            shape,
            expected,
            got: x.shape.elem_count(),
        });
    }
    Ok(vec![TensorInfo::new(x.data_id, shape, x.dtype)])
}
