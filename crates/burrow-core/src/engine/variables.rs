use super::Engine;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, Variable};

impl Engine {
    /// Promote `initial` to a named, mutable variable.
    ///
    /// The variable shares `initial`'s storage unless `dtype` asks for a
    /// cast. Without a name, one is generated from an internal counter.
    pub fn make_variable(
        &mut self,
        initial: &Tensor,
        trainable: bool,
        name: Option<&str>,
        dtype: Option<DType>,
    ) -> Result<Variable> {
        self.check_live(initial)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                let id = self.next_variable_id;
                self.next_variable_id += 1;
                id.to_string()
            }
        };
        if self.variables.contains_key(&name) {
            return Err(Error::DuplicateVariableName(name));
        }

        let cast = match dtype {
            Some(dtype) if dtype != initial.dtype() => Some(self.cast(initial, dtype)?),
            _ => None,
        };
        let value = cast.clone().unwrap_or_else(|| initial.clone());
        let backend_name = self.arena.record(value.data_id())?.backend.clone();
        let var = Variable::new(
            value.data_id(),
            value.shape().clone(),
            value.dtype(),
            &name,
            trainable,
        );
        self.track_tensor(var.tensor(), &backend_name)?;
        if let Some(cast) = cast {
            self.dispose_tensor(&cast);
        }
        self.variables.insert(name, var.clone());
        Ok(var)
    }

    /// Rebind `var` to `value`'s storage. Shape and dtype must match exactly.
    pub fn assign_variable(&mut self, var: &Variable, value: &Tensor) -> Result<()> {
        self.check_live(var.tensor())?;
        self.check_live(value)?;
        if value.shape() != var.shape() {
            return Err(Error::ShapeMismatch {
                expected: var.shape().clone(),
                got: value.shape().clone(),
            });
        }
        if value.dtype() != var.dtype() {
            return Err(Error::DTypeMismatch {
                expected: var.dtype(),
                got: value.dtype(),
            });
        }
        if value.data_id() == var.data_id() {
            return Ok(());
        }
        let backend_name = self.arena.record(value.data_id())?.backend.clone();
        self.release_ref(var.tensor());
        var.tensor().set_data_id(value.data_id());
        self.track_tensor(var.tensor(), &backend_name)
    }

    /// Dispose a variable's storage and remove it from the registry.
    pub fn dispose_variable(&mut self, var: &Variable) {
        if matches!(self.variables.get(var.name()), Some(registered) if registered.id() == var.id()) {
            self.variables.remove(var.name());
        }
        self.dispose_tensor(var.tensor());
    }

    /// Dispose every registered variable.
    pub fn dispose_variables(&mut self) {
        for var in std::mem::take(&mut self.variables).into_values() {
            self.dispose_tensor(var.tensor());
        }
    }

    /// Registered variables ordered by name.
    pub fn registered_variables(&self) -> Vec<Variable> {
        self.variables.values().cloned().collect()
    }

    /// The variable registered under `name`.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }
}
