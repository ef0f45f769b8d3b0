use crate::data::TensorData;
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::Result;
use crate::kernel::{AttrValue, Attrs, NamedTensors};
use crate::kernel_names as k;
use crate::shape::Shape;
use crate::tensor::Tensor;

// Ops — thin wrappers that dispatch named kernels
//
// Binary kernels take inputs "a" and "b"; unary kernels take "x". Binary
// ops accept equal shapes or a scalar on either side.

fn shape_attr(shape: &Shape) -> AttrValue {
    AttrValue::Ints(shape.dims().iter().map(|&d| d as i64).collect())
}

impl Engine {
    fn unary(&mut self, kernel: &str, x: &Tensor, attrs: &Attrs) -> Result<Tensor> {
        self.run_kernel(kernel, &NamedTensors::new().with("x", x), attrs)?
            .into_single()
    }

    fn binary(&mut self, kernel: &str, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let inputs = NamedTensors::new().with("a", a).with("b", b);
        self.run_kernel(kernel, &inputs, &Attrs::new())?.into_single()
    }

    pub fn add(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(k::ADD, a, b)
    }

    pub fn sub(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(k::SUB, a, b)
    }

    pub fn mul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(k::MUL, a, b)
    }

    pub fn neg(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(k::NEG, x, &Attrs::new())
    }

    pub fn square(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(k::SQUARE, x, &Attrs::new())
    }

    /// Sum of all elements, as a scalar.
    pub fn sum(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(k::SUM, x, &Attrs::new())
    }

    /// Broadcast a scalar (or same-shaped tensor) to `shape`.
    pub fn broadcast_to(&mut self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        let attrs = Attrs::new().with("shape", shape_attr(&shape.into()));
        self.unary(k::BROADCAST_TO, x, &attrs)
    }

    pub fn cast(&mut self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        let attrs = Attrs::new().with("dtype", AttrValue::DType(dtype));
        self.unary(k::CAST, x, &attrs)
    }

    /// A new tensor over the same values, recorded as its own op.
    pub fn identity(&mut self, x: &Tensor) -> Result<Tensor> {
        self.unary(k::IDENTITY, x, &Attrs::new())
    }

    pub fn reshape(&mut self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        let attrs = Attrs::new().with("shape", shape_attr(&shape.into()));
        self.unary(k::RESHAPE, x, &attrs)
    }

    // Creation

    pub fn fill(&mut self, shape: impl Into<Shape>, value: f64, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        let values = TensorData::filled(shape.elem_count(), dtype, value);
        self.make_tensor(values, shape, dtype, None)
    }

    pub fn zeros(&mut self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.fill(shape, 0.0, dtype)
    }

    pub fn ones(&mut self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.fill(shape, 1.0, dtype)
    }

    pub fn zeros_like(&mut self, x: &Tensor) -> Result<Tensor> {
        self.zeros(x.shape().clone(), x.dtype())
    }

    pub fn ones_like(&mut self, x: &Tensor) -> Result<Tensor> {
        self.ones(x.shape().clone(), x.dtype())
    }

    pub fn scalar(&mut self, value: f64, dtype: DType) -> Result<Tensor> {
        self.fill(Shape::scalar(), value, dtype)
    }
}
