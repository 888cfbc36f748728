use thiserror::Error;

use super::ops::{ConvolutionDesc, PrimitiveDesc, PrimitiveKind};
use crate::loom::{
    layout::Shape,
    memory::{Format, MemoryDesc},
    num::DataType,
};

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("memory {0} has no concrete layout")]
    Layout(MemoryDesc),
    #[error("`{operand}` has shape {found}, expected {expected}")]
    Shape {
        operand: &'static str,
        expected: Shape,
        found: Shape,
    },
    #[error("`{operand}` of type {found} is not supported here")]
    Type {
        operand: &'static str,
        found: DataType,
    },
    #[error("invalid {name}: {reason}")]
    Param { name: &'static str, reason: String },
    #[error("output scales with mask {mask:#b} need {expected} values, got {found}")]
    Scales {
        mask: u32,
        expected: usize,
        found: usize,
    },
    #[error("{0} is not supported")]
    Unsupported(String),
    #[error("{kind} binds {expected} buffers, got {found}")]
    Bindings {
        kind: PrimitiveKind,
        expected: usize,
        found: usize,
    },
}

/// The vendor acceleration library behind the emitter.
///
/// Memory handles and compute primitives share one opaque type. Handles are moved
/// into [`Vendor::release`] to be destroyed, so each is released at most once.
pub trait Vendor {
    type Primitive: std::fmt::Debug;

    /// Builds a memory handle for a buffer of the given layout. Not bound to data yet.
    fn memory(&mut self, desc: &MemoryDesc) -> Result<Self::Primitive, VendorError>;

    /// Builds a compute primitive over `memories`, ordered as [`PrimitiveKind::bindings`].
    fn primitive(
        &mut self,
        desc: &PrimitiveDesc,
        memories: &[&Self::Primitive],
    ) -> Result<Self::Primitive, VendorError>;

    /// Scratch buffer layout the primitive requires, if any.
    fn workspace(&self, desc: &PrimitiveDesc) -> Result<Option<MemoryDesc>, VendorError>;

    /// Preferred weights layout for a convolution whose weights format is [`Format::Any`].
    fn weights_format(&self, desc: &ConvolutionDesc) -> Result<Format, VendorError>;

    /// Returns `true` if the vendor can pick the convolution algorithm per shape.
    fn supports_conv_auto(&self) -> bool;

    fn release(&mut self, primitive: Self::Primitive);

    /// Frees the vendor's internal buffer cache. Called once, after every release.
    fn flush_buffers(&mut self);
}
