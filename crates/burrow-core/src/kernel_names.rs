//! Names of the kernels the engine ships gradients for.
//!
//! Backends register implementations under these names; ops in
//! [`crate::ops`] dispatch through them.

pub const ADD: &str = "Add";
pub const SUB: &str = "Sub";
pub const MUL: &str = "Mul";
pub const NEG: &str = "Neg";
pub const SQUARE: &str = "Square";
pub const SUM: &str = "Sum";
pub const BROADCAST_TO: &str = "BroadcastTo";
pub const CAST: &str = "Cast";
pub const IDENTITY: &str = "Identity";
pub const RESHAPE: &str = "Reshape";
