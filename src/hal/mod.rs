//! Operator descriptors, the vendor seam and the primitive emitter.

pub mod cpu;
pub mod emitter;
pub mod ops;
pub mod vendor;
