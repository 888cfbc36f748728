use bytemuck::Pod;
use derive_more::Display;
use half::{bf16, f16};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    BF16,
    I32,
    I8,
    U8,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::BF16 => 2,
            DataType::I32 => 4,
            DataType::I8 => 1,
            DataType::U8 => 1,
        }
    }

    /// Returns `true` for the integer types quantized primitives read and write.
    pub const fn is_integer(self) -> bool {
        matches!(self, DataType::I32 | DataType::I8 | DataType::U8)
    }
}

pub trait Scalar: Sized + Pod + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for bf16 {
    const DATA_TYPE: DataType = DataType::BF16;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Scalar for i8 {
    const DATA_TYPE: DataType = DataType::I8;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

mod sealed {
    use half::{bf16, f16};

    pub trait Sealed {}

    impl Sealed for f32 {}
    impl Sealed for f16 {}
    impl Sealed for bf16 {}
    impl Sealed for i32 {}
    impl Sealed for i8 {}
    impl Sealed for u8 {}
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::{DataType, Scalar};

    #[test]
    fn test_data_type_size() {
        assert_eq!(f32::DATA_TYPE.size(), size_of::<f32>());
        assert_eq!(f16::DATA_TYPE.size(), size_of::<f16>());
        assert_eq!(i8::DATA_TYPE.size(), size_of::<i8>());
        assert!(DataType::U8.is_integer());
        assert!(!DataType::BF16.is_integer());
    }
}
