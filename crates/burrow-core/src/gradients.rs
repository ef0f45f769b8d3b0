use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::kernel::{Attrs, GradConfig, KernelRegistry, NamedTensors};
use crate::kernel_names as k;
use crate::tensor::Tensor;

// Default gradients
//
// The chain rule for the kernels in `kernel_names`, registered on every new
// Engine. Saved tensors arrive in the order the GradConfig lists them:
// inputs first ("a", "b" or "x"), then flagged outputs.
//
//   d(a + b) = (dy, dy)          d(a - b) = (dy, -dy)
//   d(a * b) = (dy·b, dy·a)      d(-x)    = -dy
//   d(x²)    = dy·2x             d(Σx)    = broadcast(dy, shape(x))
//   d(cast x) = cast(dy, dtype(x))
//
// Binary ops broadcast scalars, so a scalar operand's gradient is the sum of
// the incoming gradient.

/// Register the gradients of all built-in kernels.
pub fn register_default_gradients(registry: &mut KernelRegistry) {
    registry.register_gradient(GradConfig::new(k::ADD, add_grad).save_all_inputs());
    registry.register_gradient(GradConfig::new(k::SUB, sub_grad).save_all_inputs());
    registry.register_gradient(GradConfig::new(k::MUL, mul_grad).save_all_inputs());
    registry.register_gradient(GradConfig::new(k::NEG, neg_grad));
    registry.register_gradient(GradConfig::new(k::SQUARE, square_grad).save_all_inputs());
    registry.register_gradient(GradConfig::new(k::SUM, sum_grad).save_all_inputs());
    registry.register_gradient(GradConfig::new(k::BROADCAST_TO, broadcast_to_grad).save_all_inputs());
    registry.register_gradient(GradConfig::new(k::CAST, cast_grad).save_all_inputs());
    registry.register_gradient(GradConfig::new(k::IDENTITY, pass_through_grad));
    registry.register_gradient(GradConfig::new(k::RESHAPE, reshape_grad).save_all_inputs());
}

fn first<'a>(tensors: &'a [Tensor], kernel: &str, what: &str) -> Result<&'a Tensor> {
    tensors
        .first()
        .ok_or_else(|| Error::msg(format!("{} gradient: missing {}", kernel, what)))
}

fn pair<'a>(saved: &'a [Tensor], kernel: &str) -> Result<(&'a Tensor, &'a Tensor)> {
    match saved {
        [a, b, ..] => Ok((a, b)),
        _ => Err(Error::msg(format!("{} gradient: expected 2 saved inputs", kernel))),
    }
}

/// Reduce `grad` back to `x`'s shape, undoing a scalar broadcast.
fn reduce_like(engine: &mut Engine, grad: &Tensor, x: &Tensor) -> Result<Tensor> {
    if grad.shape() == x.shape() {
        return Ok(grad.clone());
    }
    if x.elem_count() == 1 {
        let total = engine.sum(grad)?;
        return engine.reshape(&total, x.shape().clone());
    }
    Err(Error::ShapeMismatch {
        expected: x.shape().clone(),
        got: grad.shape().clone(),
    })
}

fn add_grad(engine: &mut Engine, dys: &[Tensor], saved: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::ADD, "dy")?;
    let (a, b) = pair(saved, k::ADD)?;
    let da = reduce_like(engine, dy, a)?;
    let db = reduce_like(engine, dy, b)?;
    Ok(NamedTensors::new().with("a", &da).with("b", &db))
}

fn sub_grad(engine: &mut Engine, dys: &[Tensor], saved: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::SUB, "dy")?;
    let (a, b) = pair(saved, k::SUB)?;
    let da = reduce_like(engine, dy, a)?;
    let neg = engine.neg(dy)?;
    let db = reduce_like(engine, &neg, b)?;
    Ok(NamedTensors::new().with("a", &da).with("b", &db))
}

fn mul_grad(engine: &mut Engine, dys: &[Tensor], saved: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::MUL, "dy")?;
    let (a, b) = pair(saved, k::MUL)?;
    let dy_b = engine.mul(dy, b)?;
    let da = reduce_like(engine, &dy_b, a)?;
    let dy_a = engine.mul(dy, a)?;
    let db = reduce_like(engine, &dy_a, b)?;
    Ok(NamedTensors::new().with("a", &da).with("b", &db))
}

fn neg_grad(engine: &mut Engine, dys: &[Tensor], _: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::NEG, "dy")?;
    let dx = engine.neg(dy)?;
    Ok(NamedTensors::new().with("x", &dx))
}

fn square_grad(engine: &mut Engine, dys: &[Tensor], saved: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::SQUARE, "dy")?;
    let x = first(saved, k::SQUARE, "x")?;
    let two = engine.scalar(2.0, x.dtype())?;
    let two_x = engine.mul(x, &two)?;
    let dx = engine.mul(dy, &two_x)?;
    Ok(NamedTensors::new().with("x", &dx))
}

fn sum_grad(engine: &mut Engine, dys: &[Tensor], saved: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::SUM, "dy")?;
    let x = first(saved, k::SUM, "x")?;
    let dx = engine.broadcast_to(dy, x.shape().clone())?;
    Ok(NamedTensors::new().with("x", &dx))
}

fn broadcast_to_grad(engine: &mut Engine, dys: &[Tensor], saved: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::BROADCAST_TO, "dy")?;
    let x = first(saved, k::BROADCAST_TO, "x")?;
    let dx = reduce_like(engine, dy, x)?;
    Ok(NamedTensors::new().with("x", &dx))
}

fn cast_grad(engine: &mut Engine, dys: &[Tensor], saved: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::CAST, "dy")?;
    let x = first(saved, k::CAST, "x")?;
    let dx = engine.cast(dy, x.dtype())?;
    Ok(NamedTensors::new().with("x", &dx))
}

fn pass_through_grad(engine: &mut Engine, dys: &[Tensor], _: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, "pass-through", "dy")?;
    let dx = engine.clone_tensor(dy)?;
    Ok(NamedTensors::new().with("x", &dx))
}

fn reshape_grad(engine: &mut Engine, dys: &[Tensor], saved: &[Tensor], _: &Attrs) -> Result<NamedTensors> {
    let dy = first(dys, k::RESHAPE, "dy")?;
    let x = first(saved, k::RESHAPE, "x")?;
    let dx = engine.reshape(dy, x.shape().clone())?;
    Ok(NamedTensors::new().with("x", &dx))
}
