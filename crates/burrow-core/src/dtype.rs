use std::fmt;

// DType — Supported element data types
//
// Every tensor has a DType that determines its element size and how the
// tracker accounts for its bytes:
//
//   F16 / BF16 / F32 / F64 — floating point, differentiable
//   I32 / I64 / U8         — integers, for indices and labels
//   Bool                   — one byte per element, 0 or 1
//   Complex64              — two f32 planes (real, imaginary)
//   String                 — variable-length byte strings, sized when written

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
    Complex64,
    String,
}

impl DType {
    /// Size of one element in bytes, or `None` for variable-length strings.
    pub fn size_in_bytes(&self) -> Option<usize> {
        match self {
            DType::F16 | DType::BF16 => Some(2),
            DType::F32 | DType::I32 => Some(4),
            DType::F64 | DType::I64 | DType::Complex64 => Some(8),
            DType::U8 | DType::Bool => Some(1),
            DType::String => None,
        }
    }

    /// Whether this dtype is a floating-point type (needed for gradient tracking).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Whether values of this dtype are stored as plain numbers.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DType::Complex64 | DType::String)
    }

    /// Number of physical backend buffers one tensor of this dtype occupies.
    ///
    /// Complex tensors keep their real and imaginary planes in separate
    /// buffers, which the leak check has to account for.
    pub fn num_buffers(&self) -> usize {
        match self {
            DType::Complex64 => 2,
            _ => 1,
        }
    }

    /// Round an f64 to the precision and range of this dtype.
    ///
    /// Returns the value unchanged for dtypes that are not stored as plain
    /// numbers.
    pub fn round_value(&self, v: f64) -> f64 {
        match self {
            DType::F16 => half::f16::from_f64(v).to_f64(),
            DType::BF16 => half::bf16::from_f64(v).to_f64(),
            DType::F32 => f32::from_f64(v).to_f64(),
            DType::F64 => v,
            DType::I32 => i32::from_f64(v).to_f64(),
            DType::I64 => i64::from_f64(v).to_f64(),
            DType::U8 => u8::from_f64(v).to_f64(),
            DType::Bool => {
                if v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Complex64 | DType::String => v,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::Bool => "bool",
            DType::Complex64 => "complex64",
            DType::String => "string",
        };
        write!(f, "{}", s)
    }
}

// WithDType — Trait that connects Rust types to DType enum
//
// Lets callers write `engine.tensor_from::<f32>(&[..], shape)` and have the
// DType picked from the Rust type.

/// Trait implemented by Rust number types that can be stored in a tensor.
pub trait WithDType: Copy + 'static + num_traits::NumCast + std::fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

impl WithDType for u8 {
    const DTYPE: DType = DType::U8;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as u8
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), Some(2));
        assert_eq!(DType::F32.size_in_bytes(), Some(4));
        assert_eq!(DType::Complex64.size_in_bytes(), Some(8));
        assert_eq!(DType::Bool.size_in_bytes(), Some(1));
        assert_eq!(DType::String.size_in_bytes(), None);
    }

    #[test]
    fn test_complex_needs_two_buffers() {
        assert_eq!(DType::Complex64.num_buffers(), 2);
        assert_eq!(DType::F32.num_buffers(), 1);
        assert!(!DType::Complex64.is_numeric());
    }

    #[test]
    fn test_round_value() {
        assert_eq!(DType::F32.round_value(0.1), 0.1f32 as f64);
        assert_eq!(DType::I32.round_value(2.7), 2.0);
        assert_eq!(DType::Bool.round_value(-3.0), 1.0);
        assert_eq!(DType::F16.round_value(65536.0 * 2.0), f64::INFINITY);
    }

    #[test]
    fn test_with_dtype_roundtrip() {
        let v: f64 = 42.0;
        assert_eq!(f64::from_f64(v).to_f64(), v);
        assert_eq!(i64::from_f64(v).to_f64(), v);
        assert_eq!(i32::DTYPE, DType::I32);
    }
}
