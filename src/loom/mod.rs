//! The `loom` module provides the data model shared by the primitive emitter and device backends.
//!
//! ## Key Components
//! 1. **Numerical System**: element types (`DataType`) and the Rust scalars mapped onto them.
//! 2. **Layouts**: immutable shapes and strides.
//! 3. **Buffer Descriptors**: `MemoryDesc` and the `Operands` trait listing a primitive's buffers.
//! 4. **Device Memory**: the `DeviceMemory` trait and a host-backed device.
//! 5. **Magic Division**: multiply-shift constants for division in generated device code.

pub mod device;
pub mod layout;
pub mod magic;
pub mod memory;
pub mod num;
