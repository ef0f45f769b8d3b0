use crate::tensor::{Tensor, Variable};

// TensorContainer — Anything a scope can preserve
//
// `end_scope` and `tidy` need the set of tensors reachable from a result value
// so they know what must survive the pop. Results can be a single tensor or
// any nesting of options, vectors, slices and tuples of tensors.
//
// Futures do not implement TensorContainer, so `tidy` cannot be handed an
// async body whose tensors would outlive the synchronous scope.

/// A value whose reachable tensors survive the end of a scope.
pub trait TensorContainer {
    /// Append every tensor reachable from `self` to `out`.
    fn collect_tensors(&self, out: &mut Vec<Tensor>);

    /// All tensors reachable from `self`, in traversal order.
    fn tensors(&self) -> Vec<Tensor> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }
}

impl TensorContainer for Tensor {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        out.push(self.clone());
    }
}

impl TensorContainer for Variable {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        out.push(self.tensor().clone());
    }
}

impl<T: TensorContainer + ?Sized> TensorContainer for &T {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        (**self).collect_tensors(out);
    }
}

impl<T: TensorContainer> TensorContainer for Option<T> {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        if let Some(inner) = self {
            inner.collect_tensors(out);
        }
    }
}

impl<T: TensorContainer> TensorContainer for [T] {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        for item in self {
            item.collect_tensors(out);
        }
    }
}

impl<T: TensorContainer> TensorContainer for Vec<T> {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        self.as_slice().collect_tensors(out);
    }
}

impl<T: TensorContainer, const N: usize> TensorContainer for [T; N] {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        self.as_slice().collect_tensors(out);
    }
}

macro_rules! tuple_container {
    ($($name:ident),+) => {
        impl<$($name: TensorContainer),+> TensorContainer for ($($name,)+) {
            #[allow(non_snake_case)]
            fn collect_tensors(&self, out: &mut Vec<Tensor>) {
                let ($($name,)+) = self;
                $($name.collect_tensors(out);)+
            }
        }
    };
}

tuple_container!(A, B);
tuple_container!(A, B, C);
tuple_container!(A, B, C, D);

// Plain values carry no tensors.
macro_rules! empty_container {
    ($($t:ty),*) => {
        $(impl TensorContainer for $t {
            fn collect_tensors(&self, _out: &mut Vec<Tensor>) {}
        })*
    };
}

empty_container!((), bool, f32, f64, i32, i64, usize, String);
