use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use super::{DeviceError, DeviceMemory, DevicePtr, Transfer, TransferFault};

/// Device memory backed by host allocations.
#[derive(Debug)]
pub struct Host {
    capacity: usize,
    alignment: usize,
    state: RwLock<HostState>,
}

#[derive(Debug, Default)]
struct HostState {
    /// Next address handed out.
    next: u64,
    /// Bytes currently reserved, alignment padding included.
    used: usize,
    buffers: BTreeMap<u64, Box<[u8]>>,
}

/// Byte range `size` bytes long at `ptr`, inside the allocation starting at `base`.
fn window(
    name: &'static str,
    ptr: DevicePtr,
    base: u64,
    len: usize,
    size: usize,
) -> Result<Range<usize>, TransferFault> {
    let offset = usize::try_from(*ptr - base).map_err(|_| TransferFault::Unknown(name, ptr))?;
    if offset > len {
        return Err(TransferFault::Unknown(name, ptr));
    }
    let available = len - offset;
    match size <= available {
        true => Ok(offset..offset + size),
        false => Err(TransferFault::Short(name, available)),
    }
}

impl HostState {
    /// Resolves `ptr` to `size` bytes of its allocation.
    fn locate(&self, name: &'static str, ptr: DevicePtr, size: usize) -> Result<&[u8], TransferFault> {
        if ptr.is_null() {
            return Err(TransferFault::Null(name));
        }
        let (&base, buffer) = self
            .buffers
            .range(..=*ptr)
            .next_back()
            .ok_or(TransferFault::Unknown(name, ptr))?;
        let range = window(name, ptr, base, buffer.len(), size)?;
        Ok(&buffer[range])
    }

    fn locate_mut(
        &mut self,
        name: &'static str,
        ptr: DevicePtr,
        size: usize,
    ) -> Result<&mut [u8], TransferFault> {
        if ptr.is_null() {
            return Err(TransferFault::Null(name));
        }
        let (&base, buffer) = self
            .buffers
            .range_mut(..=*ptr)
            .next_back()
            .ok_or(TransferFault::Unknown(name, ptr))?;
        let range = window(name, ptr, base, buffer.len(), size)?;
        Ok(&mut buffer[range])
    }
}

impl Host {
    #[inline]
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Total bytes the device may hand out.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently allocated, alignment padding included.
    pub fn used(&self) -> usize {
        self.read().used
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        self.read().buffers.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, HostState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HostState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Size reserved for a request: rounded up to the alignment, and never zero so
    /// that every allocation owns a distinct address. `None` if rounding overflows.
    #[inline]
    fn reserved(&self, size: usize) -> Option<usize> {
        size.max(1).checked_next_multiple_of(self.alignment)
    }
}

impl DeviceMemory for Host {
    fn allocate(&self, size: usize) -> Result<DevicePtr, DeviceError> {
        let mut state = self.write();
        let available = self.capacity - state.used;
        let reserved = match self.reserved(size) {
            Some(reserved) if reserved <= available => reserved,
            _ => {
                return Err(DeviceError::Alloc {
                    requested: size,
                    available,
                });
            }
        };

        let ptr = state.next;
        state.next += reserved as u64;
        state.used += reserved;
        state.buffers.insert(ptr, vec![0; size].into_boxed_slice());

        log::trace!("allocate {size} bytes at {:#x}", ptr);
        Ok(DevicePtr::from(ptr))
    }

    fn free(&self, ptr: DevicePtr) {
        if ptr.is_null() {
            return;
        }
        let mut state = self.write();
        match state.buffers.remove(&*ptr) {
            Some(buffer) => {
                let reserved = self.reserved(buffer.len()).unwrap_or(buffer.len());
                state.used = state.used.saturating_sub(reserved);
            }
            None => log::warn!("free of unallocated pointer {ptr} ignored"),
        }
    }

    fn copy(&self, transfer: Transfer<'_>, size: usize) -> Result<(), DeviceError> {
        let kind = transfer.kind();
        let fault = |reason| DeviceError::transfer(kind, size, reason);

        match transfer {
            Transfer::HostToDevice { dst, src } => {
                if src.len() < size {
                    return Err(fault(TransferFault::Short("source", src.len())));
                }
                let mut state = self.write();
                let dst = state.locate_mut("destination", dst, size).map_err(fault)?;
                dst.copy_from_slice(&src[..size]);
            }
            Transfer::DeviceToHost { dst, src } => {
                if dst.len() < size {
                    return Err(fault(TransferFault::Short("destination", dst.len())));
                }
                let state = self.read();
                let src = state.locate("source", src, size).map_err(fault)?;
                dst[..size].copy_from_slice(src);
            }
            Transfer::DeviceToDevice { dst, src } => {
                let mut state = self.write();
                let contents = state.locate("source", src, size).map_err(fault)?.to_vec();
                let dst = state.locate_mut("destination", dst, size).map_err(fault)?;
                dst.copy_from_slice(&contents);
            }
        }
        Ok(())
    }

    fn fill(&self, ptr: DevicePtr, byte: u8, size: usize) -> Result<(), DeviceError> {
        let mut state = self.write();
        let dst = state
            .locate_mut("destination", ptr, size)
            .map_err(|reason| DeviceError::Fill { size, reason })?;
        dst.fill(byte);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HostBuilder {
    pub capacity: usize,
    pub alignment: usize,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self {
            capacity: 1 << 30,
            alignment: 256,
        }
    }
}

impl HostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes the device may hand out.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Allocation granularity. Rounded up to a power of two.
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn build(self) -> Host {
        let alignment = self.alignment.max(1).next_power_of_two();
        let state = HostState {
            next: alignment as u64,
            ..Default::default()
        };
        Host {
            capacity: self.capacity,
            alignment,
            state: RwLock::new(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Host;
    use crate::loom::device::{DeviceError, DeviceMemory, DevicePtr, Transfer, TransferFault};

    #[test]
    fn test_allocate_zero() {
        let device = Host::builder().build();
        let x = device.allocate(0).unwrap();
        let y = device.allocate(0).unwrap();
        assert!(!x.is_null());
        assert!(!y.is_null());
        assert_ne!(x, y);
        assert_eq!(device.live(), 2);

        device.free(x);
        device.free(y);
        assert_eq!(device.live(), 0);
        assert_eq!(device.used(), 0);
    }

    #[test]
    fn test_free_null() {
        let device = Host::builder().build();
        device.free(DevicePtr::NULL);
        device.free(DevicePtr::from(0xdead));
        assert_eq!(device.live(), 0);
    }

    #[test]
    fn test_capacity() {
        let device = Host::builder().capacity(1024).alignment(256).build();
        let ptr = device.allocate(1000).unwrap();
        assert!(matches!(
            device.allocate(1),
            Err(DeviceError::Alloc {
                requested: 1,
                available: 0
            })
        ));
        device.free(ptr);
        assert!(device.allocate(1024).is_ok());
    }

    #[test]
    fn test_round_trip() {
        let device = Host::builder().build();
        let data = [1.0f32, 2.5, -3.0, 4.0];
        let ptr = device.upload(&data).unwrap();
        assert_eq!(device.download::<f32>(ptr, 4).unwrap(), data);
        assert_eq!(device.format_f32(ptr, 4).unwrap(), "{1, 2.5, -3, 4}");

        // interior pointers address into the same allocation
        assert_eq!(device.download::<f32>(ptr.offset(8), 2).unwrap(), [-3.0, 4.0]);

        let other = device.allocate(16).unwrap();
        device
            .copy(Transfer::DeviceToDevice { dst: other, src: ptr }, 16)
            .unwrap();
        device.fill(other, 0, 4).unwrap();
        assert_eq!(device.download::<f32>(other, 4).unwrap(), [0.0, 2.5, -3.0, 4.0]);
    }

    #[test]
    fn test_oversize_copy() {
        let device = Host::builder().build();
        let ptr = device.allocate(8).unwrap();

        let mut host = [0u8; 16];
        let err = device
            .copy(Transfer::DeviceToHost { dst: &mut host, src: ptr }, 16)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Transfer {
                size: 16,
                reason: TransferFault::Short("source", 8),
                ..
            }
        ));

        let err = device
            .copy(Transfer::HostToDevice { dst: ptr.offset(4), src: &host }, 8)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Transfer {
                reason: TransferFault::Short("destination", 4),
                ..
            }
        ));

        let err = device
            .copy(
                Transfer::HostToDevice {
                    dst: DevicePtr::NULL,
                    src: &host,
                },
                4,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Transfer {
                reason: TransferFault::Null("destination"),
                ..
            }
        ));

        assert!(matches!(
            device.fill(ptr, 0xff, 9),
            Err(DeviceError::Fill {
                size: 9,
                reason: TransferFault::Short("destination", 8)
            })
        ));
        assert!(matches!(
            device.fill(DevicePtr::from(0x10), 0, 1),
            Err(DeviceError::Fill {
                reason: TransferFault::Unknown("destination", _),
                ..
            })
        ));
    }

    #[test]
    fn test_huge_allocation() {
        let device = Host::builder().capacity(1 << 20).build();
        for size in [usize::MAX, usize::MAX - 10, usize::MAX / 2 + 1] {
            assert!(matches!(
                device.allocate(size),
                Err(DeviceError::Alloc {
                    requested,
                    available: 1048576
                }) if requested == size
            ));
        }
        assert_eq!(device.live(), 0);
        assert_eq!(device.used(), 0);

        // the device stays usable afterwards
        let ptr = device.allocate(1 << 20).unwrap();
        device.free(ptr);
        assert_eq!(device.used(), 0);
    }
}
