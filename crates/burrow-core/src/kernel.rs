use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::backend::Backend;
use crate::data::TensorData;
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::storage::{DataId, StorageArena};
use crate::tensor::{Tensor, TensorInfo};

// Kernel registry — (kernel name, backend name) → implementation
//
// A kernel is the backend-specific implementation of one named operation.
// Kernels see their inputs as TensorInfos and allocate outputs through a
// KernelContext, which mints DataIds from the Engine's arena and writes the
// values into the active backend.
//
// Gradients are registered per kernel name, independent of the backend:
//
//   GradConfig {
//     inputs_to_save:  which inputs the backward pass needs
//     outputs_to_save: which outputs the backward pass needs
//     gradient:        dys + saved tensors + attrs → named input gradients
//   }

// Attrs — Kernel attributes

/// A single kernel attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Ints(Vec<i64>),
    DType(DType),
    Str(String),
}

/// Named, non-tensor kernel parameters (axes, target shapes, dtypes).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs(BTreeMap<String, AttrValue>);

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: AttrValue) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn insert(&mut self, name: &str, value: AttrValue) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A shape stored as an `Ints` attribute.
    pub fn shape(&self, kernel: &str, name: &str) -> Result<Shape> {
        match self.0.get(name) {
            Some(AttrValue::Ints(dims)) => Ok(Shape::new(
                dims.iter().map(|&d| d.max(0) as usize).collect(),
            )),
            _ => Err(missing_attr(kernel, name)),
        }
    }

    pub fn dtype(&self, kernel: &str, name: &str) -> Result<DType> {
        match self.0.get(name) {
            Some(AttrValue::DType(d)) => Ok(*d),
            _ => Err(missing_attr(kernel, name)),
        }
    }

    pub fn float(&self, kernel: &str, name: &str) -> Result<f64> {
        match self.0.get(name) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(AttrValue::Int(v)) => Ok(*v as f64),
            _ => Err(missing_attr(kernel, name)),
        }
    }
}

fn missing_attr(kernel: &str, attr: &str) -> Error {
    Error::MissingAttr {
        kernel: kernel.to_string(),
        attr: attr.to_string(),
    }
}

// NamedTensors — Ordered (name, tensor) pairs

/// Kernel inputs and input gradients, keyed by input name in call order.
#[derive(Debug, Clone, Default)]
pub struct NamedTensors(Vec<(String, Tensor)>);

impl NamedTensors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert. A repeated name replaces the earlier entry.
    pub fn with(mut self, name: &str, tensor: &Tensor) -> Self {
        self.insert(name, tensor.clone());
        self
    }

    pub fn insert(&mut self, name: &str, tensor: Tensor) {
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = tensor,
            None => self.0.push((name.to_string(), tensor)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.0.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Tensor) -> bool) {
        self.0.retain(|(n, t)| keep(n, t));
    }
}

impl crate::container::TensorContainer for NamedTensors {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        out.extend(self.0.iter().map(|(_, t)| t.clone()));
    }
}

// KernelContext — What a running kernel can touch

/// Execution context handed to [`Kernel::run`].
pub struct KernelContext<'a> {
    kernel_name: &'a str,
    backend_name: &'a str,
    backend: &'a mut dyn Backend,
    arena: &'a mut StorageArena,
    inputs: Vec<(String, TensorInfo)>,
    attrs: &'a Attrs,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        kernel_name: &'a str,
        backend_name: &'a str,
        backend: &'a mut dyn Backend,
        arena: &'a mut StorageArena,
        inputs: Vec<(String, TensorInfo)>,
        attrs: &'a Attrs,
    ) -> Self {
        KernelContext {
            kernel_name,
            backend_name,
            backend,
            arena,
            inputs,
            attrs,
        }
    }

    pub fn kernel_name(&self) -> &str {
        self.kernel_name
    }

    pub fn backend_name(&self) -> &str {
        self.backend_name
    }

    pub fn attrs(&self) -> &Attrs {
        self.attrs
    }

    /// The named input, or `MissingKernelInput`.
    pub fn input(&self, name: &str) -> Result<&TensorInfo> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, info)| info)
            .ok_or_else(|| Error::MissingKernelInput {
                kernel: self.kernel_name.to_string(),
                input: name.to_string(),
            })
    }

    /// All inputs in call order.
    pub fn inputs(&self) -> impl Iterator<Item = &TensorInfo> {
        self.inputs.iter().map(|(_, info)| info)
    }

    /// Blocking read of an input's values from the active backend.
    pub fn read(&self, info: &TensorInfo) -> Result<TensorData> {
        self.backend.read_sync(info.data_id)
    }

    /// Allocate a new storage cell on the active backend holding `values`.
    pub fn alloc(&mut self, values: TensorData, shape: impl Into<Shape>, dtype: DType) -> Result<TensorInfo> {
        let shape = shape.into();
        values.validate(&shape, dtype)?;
        let values = values.rounded(dtype);
        let id = self.arena.reserve();
        if let Err(e) = self.backend.write(id, values, &shape, dtype) {
            self.arena.release_reservation(id);
            return Err(e);
        }
        Ok(TensorInfo::new(id, shape, dtype))
    }

    /// Direct access to the backend, for kernels that manage raw buffers.
    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        &mut *self.backend
    }

    /// Mint a DataId without writing anything. The kernel must write it to
    /// the backend itself before returning it as an output.
    pub fn reserve_data_id(&mut self) -> DataId {
        self.arena.reserve()
    }
}

/// A backend-specific implementation of one named operation.
pub trait Kernel {
    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>>;
}

impl<F> Kernel for F
where
    F: Fn(&mut KernelContext<'_>) -> Result<Vec<TensorInfo>>,
{
    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
        self(ctx)
    }
}

/// Hook run against a backend when its kernels are set up or torn down.
pub type KernelHook = Rc<dyn Fn(&mut dyn Backend)>;

/// A kernel registration for one backend.
#[derive(Clone)]
pub struct KernelConfig {
    pub kernel_name: String,
    pub backend_name: String,
    pub kernel: Rc<dyn Kernel>,
    pub setup: Option<KernelHook>,
    pub dispose: Option<KernelHook>,
}

impl KernelConfig {
    pub fn new(kernel_name: &str, backend_name: &str, kernel: impl Kernel + 'static) -> Self {
        KernelConfig {
            kernel_name: kernel_name.to_string(),
            backend_name: backend_name.to_string(),
            kernel: Rc::new(kernel),
            setup: None,
            dispose: None,
        }
    }

    pub fn with_setup(mut self, hook: impl Fn(&mut dyn Backend) + 'static) -> Self {
        self.setup = Some(Rc::new(hook));
        self
    }

    pub fn with_dispose(mut self, hook: impl Fn(&mut dyn Backend) + 'static) -> Self {
        self.dispose = Some(Rc::new(hook));
        self
    }
}

impl fmt::Debug for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelConfig")
            .field("kernel_name", &self.kernel_name)
            .field("backend_name", &self.backend_name)
            .field("setup", &self.setup.is_some())
            .field("dispose", &self.dispose.is_some())
            .finish()
    }
}

// Gradients

/// Backward function of a registered kernel.
///
/// `dys` holds one incoming gradient per kernel output. `saved` holds the
/// tensors the kernel's [`GradConfig`] asked to keep, inputs first, then
/// outputs. The result maps input names to their gradients.
pub trait Gradient {
    fn backward(
        &self,
        engine: &mut Engine,
        dys: &[Tensor],
        saved: &[Tensor],
        attrs: &Attrs,
    ) -> Result<NamedTensors>;
}

impl<F> Gradient for F
where
    F: Fn(&mut Engine, &[Tensor], &[Tensor], &Attrs) -> Result<NamedTensors>,
{
    fn backward(
        &self,
        engine: &mut Engine,
        dys: &[Tensor],
        saved: &[Tensor],
        attrs: &Attrs,
    ) -> Result<NamedTensors> {
        self(engine, dys, saved, attrs)
    }
}

/// Which inputs a gradient needs saved at record time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveInputs {
    None,
    All,
    Names(Vec<String>),
}

/// A gradient registration for one kernel name.
#[derive(Clone)]
pub struct GradConfig {
    pub kernel_name: String,
    pub inputs_to_save: SaveInputs,
    /// One flag per output; missing trailing flags mean "not saved".
    pub outputs_to_save: Vec<bool>,
    pub gradient: Rc<dyn Gradient>,
}

impl GradConfig {
    pub fn new(kernel_name: &str, gradient: impl Gradient + 'static) -> Self {
        GradConfig {
            kernel_name: kernel_name.to_string(),
            inputs_to_save: SaveInputs::None,
            outputs_to_save: Vec::new(),
            gradient: Rc::new(gradient),
        }
    }

    pub fn save_all_inputs(mut self) -> Self {
        self.inputs_to_save = SaveInputs::All;
        self
    }

    pub fn save_inputs(mut self, names: &[&str]) -> Self {
        self.inputs_to_save = SaveInputs::Names(names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn save_outputs(mut self, flags: &[bool]) -> Self {
        self.outputs_to_save = flags.to_vec();
        self
    }

    /// The tensors to save for one invocation, inputs first.
    pub(crate) fn select_saved(&self, inputs: &NamedTensors, outputs: &[Tensor]) -> Vec<Tensor> {
        let mut saved: Vec<Tensor> = match &self.inputs_to_save {
            SaveInputs::None => Vec::new(),
            SaveInputs::All => inputs.iter().map(|(_, t)| t.clone()).collect(),
            SaveInputs::Names(names) => names
                .iter()
                .filter_map(|n| inputs.get(n).cloned())
                .collect(),
        };
        saved.extend(
            outputs
                .iter()
                .zip(self.outputs_to_save.iter())
                .filter(|(_, &save)| save)
                .map(|(t, _)| t.clone()),
        );
        saved
    }
}

impl fmt::Debug for GradConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradConfig")
            .field("kernel_name", &self.kernel_name)
            .field("inputs_to_save", &self.inputs_to_save)
            .field("outputs_to_save", &self.outputs_to_save)
            .finish()
    }
}

// KernelRegistry

/// Kernel and gradient registrations, owned by an Engine.
///
/// Registrations survive `Engine::reset`.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<(String, String), KernelConfig>,
    gradients: HashMap<String, GradConfig>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel. Re-registering the same (kernel, backend) pair
    /// replaces the earlier entry.
    pub fn register_kernel(&mut self, config: KernelConfig) {
        let key = (config.kernel_name.clone(), config.backend_name.clone());
        if self.kernels.contains_key(&key) {
            log::warn!(
                "kernel '{}' for backend '{}' is already registered, overwriting",
                key.0,
                key.1
            );
        }
        self.kernels.insert(key, config);
    }

    pub fn unregister_kernel(&mut self, kernel_name: &str, backend_name: &str) -> Option<KernelConfig> {
        self.kernels
            .remove(&(kernel_name.to_string(), backend_name.to_string()))
    }

    pub fn get_kernel(&self, kernel_name: &str, backend_name: &str) -> Option<&KernelConfig> {
        self.kernels
            .get(&(kernel_name.to_string(), backend_name.to_string()))
    }

    /// All kernels registered for one backend.
    pub fn kernels_for_backend(&self, backend_name: &str) -> Vec<&KernelConfig> {
        let mut configs: Vec<&KernelConfig> = self
            .kernels
            .values()
            .filter(|c| c.backend_name == backend_name)
            .collect();
        configs.sort_by(|a, b| a.kernel_name.cmp(&b.kernel_name));
        configs
    }

    /// Register a gradient. Re-registering a kernel name replaces it.
    pub fn register_gradient(&mut self, config: GradConfig) {
        if self.gradients.contains_key(&config.kernel_name) {
            log::warn!(
                "gradient for kernel '{}' is already registered, overwriting",
                config.kernel_name
            );
        }
        self.gradients.insert(config.kernel_name.clone(), config);
    }

    pub fn unregister_gradient(&mut self, kernel_name: &str) -> Option<GradConfig> {
        self.gradients.remove(kernel_name)
    }

    pub fn get_gradient(&self, kernel_name: &str) -> Option<&GradConfig> {
        self.gradients.get(kernel_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs_shape_and_dtype() {
        let attrs = Attrs::new()
            .with("shape", AttrValue::Ints(vec![2, 3]))
            .with("dtype", AttrValue::DType(DType::F16));
        assert_eq!(attrs.shape("Reshape", "shape").unwrap(), Shape::from((2, 3)));
        assert_eq!(attrs.dtype("Cast", "dtype").unwrap(), DType::F16);
        assert!(matches!(
            attrs.float("Fill", "value"),
            Err(Error::MissingAttr { .. })
        ));
    }

    fn noop(_ctx: &mut KernelContext<'_>) -> Result<Vec<TensorInfo>> {
        Ok(Vec::new())
    }

    #[test]
    fn test_kernel_registry_lookup() {
        let mut registry = KernelRegistry::new();
        registry.register_kernel(KernelConfig::new("Noop", "cpu", noop));
        assert!(registry.get_kernel("Noop", "cpu").is_some());
        assert!(registry.get_kernel("Noop", "gpu").is_none());
        assert_eq!(registry.kernels_for_backend("cpu").len(), 1);
        assert!(registry.unregister_kernel("Noop", "cpu").is_some());
        assert!(registry.get_kernel("Noop", "cpu").is_none());
    }
}
