use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Extents of every dimension, outermost first.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

/// Element strides of every dimension, outermost first.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("({})", _0.iter().format(", "))]
pub struct Strides(Arc<[usize]>);

macro_rules! impl_from_dims {
    ($t:ty) => {
        impl From<Vec<usize>> for $t {
            #[inline]
            fn from(value: Vec<usize>) -> Self {
                Self(value.into())
            }
        }

        impl From<&[usize]> for $t {
            #[inline]
            fn from(value: &[usize]) -> Self {
                Self(value.into())
            }
        }

        impl<const N: usize> From<[usize; N]> for $t {
            #[inline]
            fn from(value: [usize; N]) -> Self {
                Self(value.into())
            }
        }
    };
}

impl_from_dims!(Shape);
impl_from_dims!(Strides);

impl Shape {
    /// Number of elements addressed by the shape.
    #[inline]
    pub fn size(&self) -> usize {
        self.iter().product()
    }

    /// Row-major strides of a densely packed tensor of this shape.
    pub fn default_strides(&self) -> Strides {
        let mut strides = vec![1; self.len()];
        for index in (0..self.len().saturating_sub(1)).rev() {
            strides[index] = strides[index + 1] * self[index + 1];
        }
        Strides::from(strides)
    }

    /// Returns the dimension at `axis`, if it exists.
    #[inline]
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.get(axis).copied()
    }
}

impl Strides {
    /// Number of elements spanned by a tensor of `shape` laid out with these strides.
    pub fn span(&self, shape: &Shape) -> usize {
        if shape.iter().any(|&dim| dim == 0) {
            return 0;
        }
        shape
            .iter()
            .zip_eq(self.iter())
            .map(|(&dim, &stride)| (dim - 1) * stride)
            .sum::<usize>()
            + 1
    }
}

#[cfg(test)]
mod tests {
    use super::{Shape, Strides};

    #[test]
    fn test_default_strides() {
        let shape = Shape::from([2, 3, 4]);
        assert_eq!(shape.default_strides(), Strides::from([12, 4, 1]));
        assert_eq!(shape.size(), 24);
        assert_eq!(shape.default_strides().span(&shape), 24);
        assert_eq!(format!("{shape}"), "[2, 3, 4]");

        let scalar = Shape::from(Vec::new());
        assert_eq!(scalar.size(), 1);
        assert_eq!(scalar.default_strides().len(), 0);
    }

    #[test]
    fn test_padded_span() {
        let shape = Shape::from([2, 3]);
        let strides = Strides::from([8, 1]);
        assert_eq!(strides.span(&shape), 11);
        assert_eq!(strides.span(&Shape::from([0, 3])), 0);
    }
}
