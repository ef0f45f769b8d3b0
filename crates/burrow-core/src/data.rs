use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

// TensorData — Host-side tensor values
//
// Values travel between the engine and a backend as TensorData. Every
// plain-number dtype is carried as f64 (rounded to the dtype's precision when
// written), complex values as two planes, and strings as raw bytes. Backends
// decide how to lay them out physically.

/// Host-side values of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// Any plain-number dtype (floats, ints, bool), widened to f64.
    Numeric(Vec<f64>),
    /// Complex values as separate real and imaginary planes.
    Complex { re: Vec<f64>, im: Vec<f64> },
    /// Variable-length byte strings.
    Strings(Vec<Vec<u8>>),
}

impl TensorData {
    /// Short name of the encoding, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            TensorData::Numeric(_) => "numeric",
            TensorData::Complex { .. } => "complex",
            TensorData::Strings(_) => "strings",
        }
    }

    /// Number of logical elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::Numeric(v) => v.len(),
            TensorData::Complex { re, .. } => re.len(),
            TensorData::Strings(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate that these values can back a tensor of `shape` and `dtype`.
    pub fn validate(&self, shape: &Shape, dtype: DType) -> Result<()> {
        let ok = match (self, dtype) {
            (TensorData::Complex { re, im }, DType::Complex64) => re.len() == im.len(),
            (TensorData::Strings(_), DType::String) => true,
            (TensorData::Numeric(_), d) if d.is_numeric() => true,
            _ => {
                return Err(Error::ValuesDTypeMismatch {
                    dtype,
                    got: self.kind(),
                })
            }
        };
        if !ok || self.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: self.len(),
            });
        }
        Ok(())
    }

    /// Round numeric values to the precision of `dtype`.
    pub fn rounded(self, dtype: DType) -> Self {
        match self {
            TensorData::Numeric(mut v) if dtype != DType::F64 => {
                v.iter_mut().for_each(|x| *x = dtype.round_value(*x));
                TensorData::Numeric(v)
            }
            TensorData::Complex { re, im } => TensorData::Complex {
                re: re.into_iter().map(|x| DType::F32.round_value(x)).collect(),
                im: im.into_iter().map(|x| DType::F32.round_value(x)).collect(),
            },
            other => other,
        }
    }

    /// Byte footprint of these values when stored as `dtype`.
    ///
    /// Strings are sized by their actual byte length, complex values as two
    /// f32 planes.
    pub fn byte_len(&self, dtype: DType) -> usize {
        match self {
            TensorData::Strings(v) => v.iter().map(Vec::len).sum(),
            TensorData::Complex { re, .. } => re.len() * 2 * 4,
            TensorData::Numeric(v) => v.len() * dtype.size_in_bytes().unwrap_or(0),
        }
    }

    /// Borrow plain-number values.
    pub fn as_f64_slice(&self) -> Result<&[f64]> {
        match self {
            TensorData::Numeric(v) => Ok(v),
            other => Err(Error::msg(format!(
                "expected numeric values, got {}",
                other.kind()
            ))),
        }
    }

    /// Take plain-number values.
    pub fn into_f64_vec(self) -> Result<Vec<f64>> {
        match self {
            TensorData::Numeric(v) => Ok(v),
            other => Err(Error::msg(format!(
                "expected numeric values, got {}",
                other.kind()
            ))),
        }
    }

    /// Borrow string values.
    pub fn as_strings(&self) -> Result<&[Vec<u8>]> {
        match self {
            TensorData::Strings(v) => Ok(v),
            other => Err(Error::msg(format!(
                "expected string values, got {}",
                other.kind()
            ))),
        }
    }

    /// Whether any numeric or complex component is NaN.
    pub fn has_nan(&self) -> bool {
        match self {
            TensorData::Numeric(v) => v.iter().any(|x| x.is_nan()),
            TensorData::Complex { re, im } => re.iter().chain(im.iter()).any(|x| x.is_nan()),
            TensorData::Strings(_) => false,
        }
    }

    /// All-zero values for `n` elements of `dtype`.
    pub fn zeros(n: usize, dtype: DType) -> Self {
        Self::filled(n, dtype, 0.0)
    }

    /// Values for `n` elements of `dtype` all set to `value`.
    ///
    /// Strings are filled with empty strings; complex values get `value` as
    /// the real part.
    pub fn filled(n: usize, dtype: DType, value: f64) -> Self {
        match dtype {
            DType::String => TensorData::Strings(vec![Vec::new(); n]),
            DType::Complex64 => TensorData::Complex {
                re: vec![value; n],
                im: vec![0.0; n],
            },
            d => TensorData::Numeric(vec![d.round_value(value); n]),
        }
    }
}

impl From<Vec<f64>> for TensorData {
    fn from(v: Vec<f64>) -> Self {
        TensorData::Numeric(v)
    }
}

impl From<&[f64]> for TensorData {
    fn from(v: &[f64]) -> Self {
        TensorData::Numeric(v.to_vec())
    }
}

impl From<Vec<f32>> for TensorData {
    fn from(v: Vec<f32>) -> Self {
        TensorData::Numeric(v.into_iter().map(f64::from).collect())
    }
}

impl From<Vec<bool>> for TensorData {
    fn from(v: Vec<bool>) -> Self {
        TensorData::Numeric(v.into_iter().map(|b| if b { 1.0 } else { 0.0 }).collect())
    }
}

impl From<Vec<&str>> for TensorData {
    fn from(v: Vec<&str>) -> Self {
        TensorData::Strings(v.into_iter().map(|s| s.as_bytes().to_vec()).collect())
    }
}

impl From<Vec<String>> for TensorData {
    fn from(v: Vec<String>) -> Self {
        TensorData::Strings(v.into_iter().map(String::into_bytes).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_counts() {
        let data = TensorData::from(vec![1.0, 2.0, 3.0]);
        assert!(data.validate(&Shape::from(3), DType::F32).is_ok());
        assert!(matches!(
            data.validate(&Shape::from(4), DType::F32),
            Err(Error::ElementCountMismatch { expected: 4, got: 3, .. })
        ));
        assert!(matches!(
            data.validate(&Shape::from(3), DType::String),
            Err(Error::ValuesDTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_string_byte_len() {
        let data = TensorData::from(vec!["ab", "cde"]);
        assert_eq!(data.byte_len(DType::String), 5);
    }

    #[test]
    fn test_rounded_to_f32() {
        let data = TensorData::from(vec![0.1f64]).rounded(DType::F32);
        assert_eq!(data.as_f64_slice().unwrap(), &[0.1f32 as f64]);
    }

    #[test]
    fn test_has_nan() {
        assert!(TensorData::from(vec![1.0, f64::NAN]).has_nan());
        assert!(!TensorData::filled(3, DType::F32, 1.0).has_nan());
    }
}
