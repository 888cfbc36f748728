use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    layout::{Shape, Strides},
    num::DataType,
};

/// Physical arrangement of a buffer's elements.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Format {
    /// Let the vendor pick. Only meaningful when querying a preferred layout.
    #[display("any")]
    Any,
    /// Canonical dense row-major layout.
    #[default]
    #[display("default")]
    Default,
    /// Explicit element strides, one per dimension.
    #[display("strided{_0}")]
    Strided(Strides),
    /// Vendor blocking. Ambiguous without a padding specification and never accepted.
    #[display("blocked")]
    Blocked,
}

/// Shape, element type and layout of one primitive operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{}:{}:{}", shape, r#type, format)]
pub struct MemoryDesc {
    pub shape: Shape,
    pub r#type: DataType,
    pub format: Format,
}

impl MemoryDesc {
    #[inline]
    pub fn new(shape: impl Into<Shape>, r#type: DataType, format: Format) -> Self {
        let shape = shape.into();
        Self {
            shape,
            r#type,
            format,
        }
    }

    /// A densely packed row-major descriptor.
    #[inline]
    pub fn dense(shape: impl Into<Shape>, r#type: DataType) -> Self {
        Self::new(shape, r#type, Format::Default)
    }

    /// A descriptor with explicit element strides.
    #[inline]
    pub fn strided(shape: impl Into<Shape>, strides: impl Into<Strides>, r#type: DataType) -> Self {
        Self::new(shape, r#type, Format::Strided(strides.into()))
    }

    /// A descriptor whose layout is left to the vendor.
    #[inline]
    pub fn any(shape: impl Into<Shape>, r#type: DataType) -> Self {
        Self::new(shape, r#type, Format::Any)
    }

    /// Same descriptor with another element type.
    #[inline]
    pub fn with_type(&self, r#type: DataType) -> Self {
        Self {
            r#type,
            ..self.clone()
        }
    }

    /// Number of logical elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Strides implied by the format, if the format fixes them.
    pub fn strides(&self) -> Option<Strides> {
        match &self.format {
            Format::Default => Some(self.shape.default_strides()),
            Format::Strided(strides) => Some(strides.clone()),
            Format::Any | Format::Blocked => None,
        }
    }

    /// Bytes spanned by the layout, padding included.
    pub fn data_size(&self) -> usize {
        let elements = match &self.format {
            Format::Strided(strides) if strides.len() == self.shape.len() => {
                strides.span(&self.shape)
            }
            _ => self.size(),
        };
        elements * self.r#type.size()
    }
}

/// Implemented by primitive descriptors. Lists buffer operands in dependency order.
///
/// Usually derived with `#[derive(Operands)]`.
pub trait Operands {
    fn operands(&self) -> Vec<&MemoryDesc>;
    fn operand_names(&self) -> Vec<&'static str>;
}

/// Field types that may hold operands.
pub trait IntoOperands {
    fn collect_operands<'a>(&'a self, operands: &mut Vec<&'a MemoryDesc>);
    fn collect_names(&self, name: &'static str, names: &mut Vec<&'static str>);
}

impl IntoOperands for MemoryDesc {
    #[inline]
    fn collect_operands<'a>(&'a self, operands: &mut Vec<&'a MemoryDesc>) {
        operands.push(self);
    }

    #[inline]
    fn collect_names(&self, name: &'static str, names: &mut Vec<&'static str>) {
        names.push(name);
    }
}

impl IntoOperands for Option<MemoryDesc> {
    #[inline]
    fn collect_operands<'a>(&'a self, operands: &mut Vec<&'a MemoryDesc>) {
        operands.extend(self.iter());
    }

    #[inline]
    fn collect_names(&self, name: &'static str, names: &mut Vec<&'static str>) {
        names.extend(self.iter().map(|_| name));
    }
}

impl IntoOperands for Vec<MemoryDesc> {
    #[inline]
    fn collect_operands<'a>(&'a self, operands: &mut Vec<&'a MemoryDesc>) {
        operands.extend(self.iter());
    }

    #[inline]
    fn collect_names(&self, name: &'static str, names: &mut Vec<&'static str>) {
        names.extend(self.iter().map(|_| name));
    }
}

#[cfg(test)]
mod tests {
    use super::{Format, MemoryDesc};
    use crate::loom::{layout::Strides, num::DataType};

    #[test]
    fn test_data_size() {
        let desc = MemoryDesc::dense([2, 3], DataType::F32);
        assert_eq!(desc.data_size(), 24);
        assert_eq!(desc.strides(), Some(Strides::from([3, 1])));

        let desc = MemoryDesc::strided([2, 3], [4, 1], DataType::F16);
        assert_eq!(desc.data_size(), 14);

        let desc = MemoryDesc::new([2, 3], DataType::I8, Format::Blocked);
        assert_eq!(desc.strides(), None);
        assert_eq!(format!("{desc}"), "[2, 3]:I8:blocked");
    }
}
