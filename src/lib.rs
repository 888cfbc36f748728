//! Compute-primitive emitter and device memory helpers for deep-learning compiler backends.
//!
//! [`hal::emitter::Emitter`] turns operator descriptions into vendor primitives with explicit
//! buffer descriptors and keeps them in an index-addressed registry. [`loom::device`] and
//! [`loom::magic`] hold the helpers generated device code relies on.

pub mod hal;
pub mod loom;

pub use weft_derive::Operands;
