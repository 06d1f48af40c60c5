//! Element types a dataset can hold.

use crate::error::{DataSetError, Result};
use nndataset_kernels::KernelElem;
use safetensors::Dtype;

/// On-disk element tag.
///
/// Values 6 and 7 belong to the image kinds of the file format and are not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataType {
    UInt = 0,
    Int = 1,
    LLInt = 2,
    ULLInt = 3,
    Float = 4,
    Double = 5,
    UChar = 8,
    Char = 9,
}

impl DataType {
    pub fn from_tag(tag: u32) -> Result<Self> {
        Ok(match tag {
            0 => DataType::UInt,
            1 => DataType::Int,
            2 => DataType::LLInt,
            3 => DataType::ULLInt,
            4 => DataType::Float,
            5 => DataType::Double,
            8 => DataType::UChar,
            9 => DataType::Char,
            other => return Err(DataSetError::UnsupportedDataType(other)),
        })
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    /// The safetensors dtype used to store elements of this type.
    pub fn dtype(self) -> Dtype {
        match self {
            DataType::UInt => Dtype::U32,
            DataType::Int => Dtype::I32,
            DataType::LLInt => Dtype::I64,
            DataType::ULLInt => Dtype::U64,
            DataType::Float => Dtype::F32,
            DataType::Double => Dtype::F64,
            DataType::UChar => Dtype::U8,
            DataType::Char => Dtype::I8,
        }
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            DataType::UChar | DataType::Char => 1,
            DataType::UInt | DataType::Int | DataType::Float => 4,
            DataType::LLInt | DataType::ULLInt | DataType::Double => 8,
        }
    }
}

/// Trait bound for elements that can be stored in a dataset.
///
/// Elements travel between workers and to disk as little-endian bytes.
pub trait DataElem: KernelElem + Default + 'static {
    const DATA_TYPE: DataType;

    fn write_le(&self, out: &mut Vec<u8>);

    /// Decodes one element from exactly `DATA_TYPE.size()` bytes.
    fn read_le(bytes: &[u8]) -> Self;

    fn encode_slice(values: &[Self]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * Self::DATA_TYPE.size());
        for v in values {
            v.write_le(&mut out);
        }
        out
    }

    /// Decodes a packed little-endian array.
    ///
    /// # Errors
    ///
    /// Returns [`DataSetError::ShapeMismatch`] if `bytes` is not a whole number of elements.
    fn decode_slice(bytes: &[u8]) -> Result<Vec<Self>> {
        let size = Self::DATA_TYPE.size();
        if bytes.len() % size != 0 {
            return Err(DataSetError::ShapeMismatch {
                what: format!("{:?} byte buffer", Self::DATA_TYPE),
                expected: vec![bytes.len() / size * size],
                got: vec![bytes.len()],
            });
        }
        Ok(bytes.chunks_exact(size).map(Self::read_le).collect())
    }
}

macro_rules! impl_data_elem {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl DataElem for $ty {
                const DATA_TYPE: DataType = DataType::$tag;

                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_data_elem! {
    u32 => UInt,
    i32 => Int,
    i64 => LLInt,
    u64 => ULLInt,
    f32 => Float,
    f64 => Double,
    u8 => UChar,
    i8 => Char,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for tag in [0, 1, 2, 3, 4, 5, 8, 9] {
            assert_eq!(DataType::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(matches!(
            DataType::from_tag(6),
            Err(DataSetError::UnsupportedDataType(6))
        ));
        assert!(DataType::from_tag(7).is_err());
    }

    #[test]
    fn test_sizes_match_rust_types() {
        assert_eq!(u8::DATA_TYPE.size(), 1);
        assert_eq!(i8::DATA_TYPE.size(), 1);
        assert_eq!(f32::DATA_TYPE.size(), 4);
        assert_eq!(u64::DATA_TYPE.size(), 8);
        assert_eq!(f64::DATA_TYPE.dtype(), Dtype::F64);
    }

    #[test]
    fn test_encode_decode() {
        let values = [-1i32, 0, 7, i32::MAX];
        let bytes = i32::encode_slice(&values);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(i32::decode_slice(&bytes).unwrap(), values);
    }

    #[test]
    fn test_decode_rejects_partial_element() {
        assert!(f64::decode_slice(&[0u8; 12]).is_err());
    }
}
