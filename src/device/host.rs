//! Host-memory device backend
//!
//! The caching allocators are registered for the CPU device type as well as
//! the GPU: the same bin structure and async-release protocol run over plain
//! host memory. There is no asynchronous execution on the host, so every
//! event is complete the moment it is recorded.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::device::{
    DeviceError, DeviceIndex, DevicePtr, DeviceResult, DeviceStream, DeviceType, EventStatus,
    RawDevice, RawEventHandle, RawStreamHandle,
};

/// Minimum alignment handed back by the host backend, matching the device
/// allocation quantum.
const HOST_ALLOC_ALIGN: usize = 512;

/// Host (CPU) implementation of [`RawDevice`].
#[derive(Debug, Default)]
pub struct HostDevice {
    // `dealloc` needs the original layout back; remember it per address.
    layouts: Mutex<HashMap<usize, Layout>>,
    next_event: AtomicUsize,
}

impl HostDevice {
    pub fn new() -> Self {
        HostDevice {
            layouts: Mutex::new(HashMap::new()),
            next_event: AtomicUsize::new(1),
        }
    }
}

impl RawDevice for HostDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn current_device(&self) -> DeviceResult<DeviceIndex> {
        Ok(0)
    }

    fn set_device(&self, index: DeviceIndex) -> DeviceResult<()> {
        if index == 0 {
            Ok(())
        } else {
            Err(DeviceError::InvalidDevice(index))
        }
    }

    fn current_stream(&self, device_index: DeviceIndex) -> DeviceStream {
        DeviceStream::new(0, device_index, 0)
    }

    fn raw_allocate(&self, nbytes: usize) -> DeviceResult<DevicePtr> {
        if nbytes == 0 {
            return Ok(DevicePtr::null());
        }
        let layout = Layout::from_size_align(nbytes, HOST_ALLOC_ALIGN)
            .map_err(|e| DeviceError::AllocationFailed(e.to_string()))?;
        // SAFETY: layout has non-zero size, checked above.
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(DeviceError::AllocationFailed(format!(
                "host allocation of {} bytes failed",
                nbytes
            )));
        }
        self.layouts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ptr as usize, layout);
        tracing::trace!("HostDevice: allocated {} bytes at {:p}", nbytes, ptr);
        Ok(DevicePtr::new(ptr.cast()))
    }

    fn raw_deallocate(&self, ptr: DevicePtr) -> DeviceResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let layout = self
            .layouts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(ptr.as_raw() as usize))
            .ok_or_else(|| {
                DeviceError::DeallocationFailed(format!("unknown host pointer {:p}", ptr))
            })?;
        // SAFETY: ptr came from alloc::alloc with exactly this layout.
        unsafe { alloc::dealloc(ptr.as_raw().cast(), layout) };
        Ok(())
    }

    fn create_event(&self) -> DeviceResult<RawEventHandle> {
        Ok(self.next_event.fetch_add(1, Ordering::Relaxed))
    }

    fn destroy_event(&self, _event: RawEventHandle) -> DeviceResult<()> {
        Ok(())
    }

    fn record_event(&self, _event: RawEventHandle, _stream: RawStreamHandle) -> DeviceResult<()> {
        Ok(())
    }

    fn event_status(&self, _event: RawEventHandle) -> DeviceResult<EventStatus> {
        // Host work is synchronous; anything recorded has already happened.
        Ok(EventStatus::Ready)
    }

    fn wait_event(&self, _event: RawEventHandle) -> DeviceResult<()> {
        Ok(())
    }

    fn stream_wait_event(
        &self,
        _stream: RawStreamHandle,
        _event: RawEventHandle,
    ) -> DeviceResult<()> {
        Ok(())
    }

    fn event_elapsed_time(
        &self,
        _start: RawEventHandle,
        _end: RawEventHandle,
    ) -> DeviceResult<f32> {
        Ok(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_allocate_release_roundtrip() {
        let dev = HostDevice::new();
        let ptr = dev.raw_allocate(4096).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(ptr.as_raw() as usize % HOST_ALLOC_ALIGN, 0);
        dev.raw_deallocate(ptr).unwrap();
    }

    #[test]
    fn test_host_zero_byte_allocation_is_null() {
        let dev = HostDevice::new();
        let ptr = dev.raw_allocate(0).unwrap();
        assert!(ptr.is_null());
        dev.raw_deallocate(ptr).unwrap();
    }

    #[test]
    fn test_host_unknown_pointer_rejected() {
        let dev = HostDevice::new();
        let bogus = DevicePtr::new(0x1234usize as *mut _);
        assert!(dev.raw_deallocate(bogus).is_err());
    }

    #[test]
    fn test_host_events_always_ready() {
        let dev = HostDevice::new();
        let ev = dev.create_event().unwrap();
        dev.record_event(ev, 0).unwrap();
        assert_eq!(dev.event_status(ev).unwrap(), EventStatus::Ready);
        dev.destroy_event(ev).unwrap();
    }

    #[test]
    fn test_host_rejects_nonzero_device() {
        let dev = HostDevice::new();
        assert!(dev.set_device(0).is_ok());
        assert!(dev.set_device(1).is_err());
    }
}
