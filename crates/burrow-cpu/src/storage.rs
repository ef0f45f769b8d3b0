// CpuStorage — Typed host buffers
//
// Values cross the Backend boundary as TensorData (f64 numbers, complex
// planes or byte strings). Inside the CPU backend they are kept in their
// native element type so memory accounting and precision match the dtype:
//
//   F16/BF16  Vec<half::f16> / Vec<half::bf16>
//   F32..U8   Vec<T>
//   Bool      Vec<bool>
//   Complex64 separate re/im planes (two physical buffers)
//   String    Vec<Vec<u8>>

use half::{bf16, f16};

use burrow_core::data::TensorData;
use burrow_core::dtype::DType;
use burrow_core::error::{Error, Result};

/// One host allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
    Complex64 { re: Vec<f32>, im: Vec<f32> },
    String(Vec<Vec<u8>>),
}

impl CpuStorage {
    /// Convert engine-level values into a typed buffer of `dtype`.
    pub fn from_data(values: TensorData, dtype: DType) -> Result<Self> {
        let storage = match (values, dtype) {
            (TensorData::Numeric(v), DType::F16) => CpuStorage::F16(v.into_iter().map(f16::from_f64).collect()),
            (TensorData::Numeric(v), DType::BF16) => CpuStorage::BF16(v.into_iter().map(bf16::from_f64).collect()),
            (TensorData::Numeric(v), DType::F32) => CpuStorage::F32(v.into_iter().map(|x| x as f32).collect()),
            (TensorData::Numeric(v), DType::F64) => CpuStorage::F64(v),
            (TensorData::Numeric(v), DType::I32) => CpuStorage::I32(v.into_iter().map(|x| x as i32).collect()),
            (TensorData::Numeric(v), DType::I64) => CpuStorage::I64(v.into_iter().map(|x| x as i64).collect()),
            (TensorData::Numeric(v), DType::U8) => CpuStorage::U8(v.into_iter().map(|x| x as u8).collect()),
            (TensorData::Numeric(v), DType::Bool) => CpuStorage::Bool(v.into_iter().map(|x| x != 0.0).collect()),
            (TensorData::Complex { re, im }, DType::Complex64) => CpuStorage::Complex64 {
                re: re.into_iter().map(|x| x as f32).collect(),
                im: im.into_iter().map(|x| x as f32).collect(),
            },
            (TensorData::Strings(v), DType::String) => CpuStorage::String(v),
            (values, dtype) => {
                return Err(Error::ValuesDTypeMismatch {
                    dtype,
                    got: values.kind(),
                })
            }
        };
        Ok(storage)
    }

    /// Widen back to engine-level values.
    pub fn to_data(&self) -> TensorData {
        match self {
            CpuStorage::F16(v) => TensorData::Numeric(v.iter().map(|x| x.to_f64()).collect()),
            CpuStorage::BF16(v) => TensorData::Numeric(v.iter().map(|x| x.to_f64()).collect()),
            CpuStorage::F32(v) => TensorData::Numeric(v.iter().map(|&x| x as f64).collect()),
            CpuStorage::F64(v) => TensorData::Numeric(v.clone()),
            CpuStorage::I32(v) => TensorData::Numeric(v.iter().map(|&x| x as f64).collect()),
            CpuStorage::I64(v) => TensorData::Numeric(v.iter().map(|&x| x as f64).collect()),
            CpuStorage::U8(v) => TensorData::Numeric(v.iter().map(|&x| x as f64).collect()),
            CpuStorage::Bool(v) => TensorData::Numeric(v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect()),
            CpuStorage::Complex64 { re, im } => TensorData::Complex {
                re: re.iter().map(|&x| x as f64).collect(),
                im: im.iter().map(|&x| x as f64).collect(),
            },
            CpuStorage::String(v) => TensorData::Strings(v.clone()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::I32(_) => DType::I32,
            CpuStorage::I64(_) => DType::I64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::Bool(_) => DType::Bool,
            CpuStorage::Complex64 { .. } => DType::Complex64,
            CpuStorage::String(_) => DType::String,
        }
    }

    /// Physical buffers held: two for complex planes, one otherwise.
    pub fn num_buffers(&self) -> usize {
        self.dtype().num_buffers()
    }

    /// Bytes held on the host.
    pub fn byte_len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len() * 2,
            CpuStorage::BF16(v) => v.len() * 2,
            CpuStorage::F32(v) => v.len() * 4,
            CpuStorage::F64(v) => v.len() * 8,
            CpuStorage::I32(v) => v.len() * 4,
            CpuStorage::I64(v) => v.len() * 8,
            CpuStorage::U8(v) => v.len(),
            CpuStorage::Bool(v) => v.len(),
            CpuStorage::Complex64 { re, im } => (re.len() + im.len()) * 4,
            CpuStorage::String(v) => v.iter().map(Vec::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f16_storage_rounds_and_widens() {
        let s = CpuStorage::from_data(TensorData::Numeric(vec![1.0, 0.1]), DType::F16).unwrap();
        assert_eq!(s.byte_len(), 4);
        let back = s.to_data().into_f64_vec().unwrap();
        assert_eq!(back[0], 1.0);
        assert!((back[1] - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_complex_counts_two_buffers() {
        let s = CpuStorage::from_data(
            TensorData::Complex {
                re: vec![1.0, 2.0],
                im: vec![0.5, 0.0],
            },
            DType::Complex64,
        )
        .unwrap();
        assert_eq!(s.num_buffers(), 2);
        assert_eq!(s.byte_len(), 16);
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let err = CpuStorage::from_data(TensorData::Numeric(vec![1.0]), DType::String).unwrap_err();
        assert!(matches!(err, Error::ValuesDTypeMismatch { .. }));
    }

    #[test]
    fn test_bool_storage() {
        let s = CpuStorage::from_data(TensorData::Numeric(vec![0.0, 2.0]), DType::Bool).unwrap();
        assert_eq!(s, CpuStorage::Bool(vec![false, true]));
        assert_eq!(s.to_data(), TensorData::Numeric(vec![0.0, 1.0]));
    }
}
