use std::collections::HashSet;

use super::Engine;
use crate::container::TensorContainer;
use crate::error::{Error, Result};
use crate::tensor::{ScopeId, Tensor, TensorId};

// Scopes — deterministic disposal of intermediates
//
//   engine.tidy("step", |e| {          push frame #n
//       let a = e.add(&x, &y)?;        a tracked in #n
//       let b = e.mul(&a, &a)?;        b tracked in #n
//       Ok(b)                          pop: a disposed, b re-tracked in #n-1
//   })
//
// Kept tensors and variables are never disposed by a pop. Result tensors
// allocated in an outer frame are left where they are.

#[derive(Debug)]
pub(super) struct ScopeFrame {
    pub(super) id: ScopeId,
    pub(super) name: String,
    pub(super) track: Vec<Tensor>,
}

impl Engine {
    /// Push a tracking frame. Tensors created until the matching
    /// [`end_scope`](Engine::end_scope) are tracked in it.
    pub fn start_scope(&mut self, name: &str) {
        let id = self.next_scope_id;
        self.next_scope_id += 1;
        log::trace!("start scope {} ({})", name, id);
        self.scopes.push(ScopeFrame {
            id,
            name: name.to_string(),
            track: Vec::new(),
        });
    }

    /// Pop the active frame, disposing everything it tracked except kept
    /// tensors and the tensors reachable from `result`.
    pub fn end_scope(&mut self, result: &dyn TensorContainer) -> Result<()> {
        let frame = self
            .scopes
            .pop()
            .ok_or_else(|| Error::msg("end_scope called without an active scope"))?;
        let results = result.tensors();
        let keep: HashSet<TensorId> = results.iter().map(Tensor::id).collect();

        for tensor in &frame.track {
            if !tensor.is_kept() && !keep.contains(&tensor.id()) {
                self.dispose_tensor(tensor);
            }
        }
        log::trace!("end scope {} ({})", frame.name, frame.id);

        for tensor in &results {
            if !tensor.is_kept() && tensor.scope_id() == Some(frame.id) {
                self.track_in_scope(tensor);
            }
        }
        Ok(())
    }

    /// Run `f` inside a fresh scope and dispose every intermediate it
    /// created that is neither kept nor part of its result.
    ///
    /// The scope is ended on both the Ok and the Err path.
    pub fn tidy<T, F>(&mut self, name: &str, f: F) -> Result<T>
    where
        T: TensorContainer,
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        self.start_scope(name);
        match f(self) {
            Ok(result) => {
                self.end_scope(&result)?;
                Ok(result)
            }
            Err(e) => {
                if let Err(scope_err) = self.end_scope(&()) {
                    log::warn!("tidy {}: {}", name, scope_err);
                }
                Err(e)
            }
        }
    }

    /// Mark `tensor` to survive every enclosing scope until disposed.
    pub fn keep(&mut self, tensor: &Tensor) -> Tensor {
        tensor.set_kept();
        tensor.clone()
    }

    /// Number of open scopes.
    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Name of the innermost open scope.
    pub fn active_scope_name(&self) -> Option<&str> {
        self.scopes.last().map(|frame| frame.name.as_str())
    }

    pub(super) fn track_in_scope(&mut self, tensor: &Tensor) {
        if let Some(frame) = self.scopes.last_mut() {
            tensor.set_scope_id(frame.id);
            frame.track.push(tensor.clone());
        }
    }
}
