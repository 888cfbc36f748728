//! Device memory primitives used by generated device code: allocation, copies and fills.
//!
//! Every operation is synchronous. Pointers are opaque device addresses; interior pointers
//! (an allocation's base plus an offset) are valid wherever a base pointer is.

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::num::Scalar;

pub use host::{Host, HostBuilder};

pub mod host;

/// An opaque device address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{_0:#x}")]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Address `bytes` past this one.
    #[inline]
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

/// Direction of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CopyKind {
    #[display("host to device")]
    HostToDevice,
    #[display("device to host")]
    DeviceToHost,
    #[display("device to device")]
    DeviceToDevice,
}

/// Source and destination of a copy.
#[derive(Debug)]
pub enum Transfer<'a> {
    HostToDevice { dst: DevicePtr, src: &'a [u8] },
    DeviceToHost { dst: &'a mut [u8], src: DevicePtr },
    DeviceToDevice { dst: DevicePtr, src: DevicePtr },
}

impl Transfer<'_> {
    #[inline]
    pub fn kind(&self) -> CopyKind {
        match self {
            Transfer::HostToDevice { .. } => CopyKind::HostToDevice,
            Transfer::DeviceToHost { .. } => CopyKind::DeviceToHost,
            Transfer::DeviceToDevice { .. } => CopyKind::DeviceToDevice,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to allocate {requested} bytes: {available} bytes available")]
    Alloc { requested: usize, available: usize },
    #[error("failed to copy {size} bytes {kind}: {reason}")]
    Transfer {
        kind: CopyKind,
        size: usize,
        reason: TransferFault,
    },
    #[error("failed to fill {size} bytes: {reason}")]
    Fill { size: usize, reason: TransferFault },
}

/// Why a transfer was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransferFault {
    #[display("null pointer {_0}")]
    Null(&'static str),
    #[display("{_0} pointer {_1} is not allocated")]
    Unknown(&'static str, DevicePtr),
    #[display("{_0} holds {_1} bytes")]
    Short(&'static str, usize),
}

impl DeviceError {
    #[inline]
    pub fn transfer(kind: CopyKind, size: usize, reason: TransferFault) -> Self {
        Self::Transfer { kind, size, reason }
    }
}

/// A device runtime's memory interface.
pub trait DeviceMemory {
    /// Allocates `size` bytes. Never returns a null pointer on success.
    fn allocate(&self, size: usize) -> Result<DevicePtr, DeviceError>;

    /// Releases an allocation. Freeing null does nothing.
    fn free(&self, ptr: DevicePtr);

    /// Copies `size` bytes and waits for completion.
    fn copy(&self, transfer: Transfer<'_>, size: usize) -> Result<(), DeviceError>;

    /// Sets `size` bytes starting at `ptr` to `byte` and waits for completion.
    fn fill(&self, ptr: DevicePtr, byte: u8, size: usize) -> Result<(), DeviceError>;

    /// Allocates a buffer holding `data`.
    fn upload<T: Scalar>(&self, data: &[T]) -> Result<DevicePtr, DeviceError> {
        let src: &[u8] = bytemuck::cast_slice(data);
        let ptr = self.allocate(src.len())?;
        if let Err(err) = self.copy(Transfer::HostToDevice { dst: ptr, src }, src.len()) {
            self.free(ptr);
            return Err(err);
        }
        Ok(ptr)
    }

    /// Reads `count` elements back to the host.
    fn download<T: Scalar>(&self, ptr: DevicePtr, count: usize) -> Result<Vec<T>, DeviceError> {
        let mut data = vec![T::zeroed(); count];
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut data);
        let size = dst.len();
        self.copy(Transfer::DeviceToHost { dst, src: ptr }, size)?;
        Ok(data)
    }

    /// Renders `count` `f32` elements as `{a, b, c}`.
    fn format_f32(&self, ptr: DevicePtr, count: usize) -> Result<String, DeviceError> {
        let data = self.download::<f32>(ptr, count)?;
        Ok(format!("{{{}}}", data.iter().format(", ")))
    }
}
