//! ROCm/HIP device backend
//!
//! Implements [`RawDevice`] directly over the HIP runtime. The HIP device
//! context is PER-THREAD, not global: `hipSetDevice` only affects the
//! calling thread, so the current device is tracked in a thread-local cache
//! to avoid repeated `hipGetDevice` round trips.

mod ffi;

use std::cell::Cell;
use std::ffi::CStr;
use std::ptr;
use std::thread_local;

use crate::device::{
    DeviceError, DeviceIndex, DevicePtr, DeviceResult, DeviceStream, DeviceType, EventStatus,
    RawDevice, RawEventHandle, RawStreamHandle,
};

thread_local! {
    static THREAD_DEVICE_ID: Cell<i32> = const { Cell::new(-1) };
}

/// Readable message for a HIP status code
fn hip_error_string(code: i32) -> String {
    // SAFETY: hipGetErrorString returns a static NUL-terminated string for
    // every status code, including unknown ones.
    unsafe {
        let ptr = ffi::hipGetErrorString(code);
        if ptr.is_null() {
            format!("hip error {}", code)
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

/// HIP implementation of [`RawDevice`].
///
/// Events are created with timing disabled; the allocator only uses them as
/// completion fences. `event_elapsed_time` still works for events created
/// through other paths that carry timing data.
#[derive(Debug, Default)]
pub struct HipDevice;

impl HipDevice {
    pub fn new() -> Self {
        HipDevice
    }
}

impl RawDevice for HipDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Hip
    }

    fn current_device(&self) -> DeviceResult<DeviceIndex> {
        THREAD_DEVICE_ID.with(|cell| {
            let cached = cell.get();
            if cached >= 0 {
                return Ok(cached);
            }
            let mut device: i32 = -1;
            let result = unsafe { ffi::hipGetDevice(&mut device) };
            if result != ffi::HIP_SUCCESS {
                return Err(DeviceError::DeviceSelectionFailed(format!(
                    "hipGetDevice failed: {}",
                    hip_error_string(result)
                )));
            }
            cell.set(device);
            Ok(device)
        })
    }

    fn set_device(&self, index: DeviceIndex) -> DeviceResult<()> {
        let result = unsafe { ffi::hipSetDevice(index) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::DeviceSelectionFailed(format!(
                "hipSetDevice({}) failed: {}",
                index,
                hip_error_string(result)
            )));
        }
        THREAD_DEVICE_ID.with(|cell| cell.set(index));
        Ok(())
    }

    fn current_stream(&self, device_index: DeviceIndex) -> DeviceStream {
        // Stream management lives in the runtime above this crate; raw
        // handle 0 is HIP's default (null) stream.
        DeviceStream::new(0, device_index, 0)
    }

    fn raw_allocate(&self, nbytes: usize) -> DeviceResult<DevicePtr> {
        if nbytes == 0 {
            return Ok(DevicePtr::null());
        }
        let mut ptr: *mut std::ffi::c_void = ptr::null_mut();
        let result = unsafe { ffi::hipMalloc(&mut ptr, nbytes) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::AllocationFailed(format!(
                "hipMalloc({} bytes) failed: {}",
                nbytes,
                hip_error_string(result)
            )));
        }
        if ptr.is_null() {
            return Err(DeviceError::AllocationFailed(format!(
                "hipMalloc returned null pointer for {} bytes",
                nbytes
            )));
        }
        tracing::trace!("HipDevice: allocated {} bytes at {:?}", nbytes, ptr);
        Ok(DevicePtr::new(ptr))
    }

    fn raw_deallocate(&self, ptr: DevicePtr) -> DeviceResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let result = unsafe { ffi::hipFree(ptr.as_raw()) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::DeallocationFailed(format!(
                "hipFree({:p}) failed: {}",
                ptr,
                hip_error_string(result)
            )));
        }
        Ok(())
    }

    fn create_event(&self) -> DeviceResult<RawEventHandle> {
        let mut event: *mut std::ffi::c_void = ptr::null_mut();
        let result =
            unsafe { ffi::hipEventCreateWithFlags(&mut event, ffi::HIP_EVENT_DISABLE_TIMING) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::EventFailed(format!(
                "hipEventCreateWithFlags failed: {}",
                hip_error_string(result)
            )));
        }
        if event.is_null() {
            return Err(DeviceError::EventFailed(
                "hipEventCreateWithFlags returned null pointer".to_string(),
            ));
        }
        Ok(event as RawEventHandle)
    }

    fn destroy_event(&self, event: RawEventHandle) -> DeviceResult<()> {
        let result = unsafe { ffi::hipEventDestroy(event as *mut _) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::EventFailed(format!(
                "hipEventDestroy failed: {}",
                hip_error_string(result)
            )));
        }
        Ok(())
    }

    fn record_event(&self, event: RawEventHandle, stream: RawStreamHandle) -> DeviceResult<()> {
        let result = unsafe { ffi::hipEventRecord(event as *mut _, stream as *mut _) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::EventFailed(format!(
                "hipEventRecord failed: {}",
                hip_error_string(result)
            )));
        }
        Ok(())
    }

    fn event_status(&self, event: RawEventHandle) -> DeviceResult<EventStatus> {
        let result = unsafe { ffi::hipEventQuery(event as *mut _) };
        match result {
            ffi::HIP_SUCCESS => Ok(EventStatus::Ready),
            ffi::HIP_ERROR_NOT_READY => Ok(EventStatus::NotReady),
            code => Err(DeviceError::EventFailed(format!(
                "hipEventQuery failed: {}",
                hip_error_string(code)
            ))),
        }
    }

    fn wait_event(&self, event: RawEventHandle) -> DeviceResult<()> {
        let result = unsafe { ffi::hipEventSynchronize(event as *mut _) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::EventFailed(format!(
                "hipEventSynchronize failed: {}",
                hip_error_string(result)
            )));
        }
        Ok(())
    }

    fn stream_wait_event(
        &self,
        stream: RawStreamHandle,
        event: RawEventHandle,
    ) -> DeviceResult<()> {
        let result = unsafe { ffi::hipStreamWaitEvent(stream as *mut _, event as *mut _, 0) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::StreamFailed(format!(
                "hipStreamWaitEvent failed: {}",
                hip_error_string(result)
            )));
        }
        Ok(())
    }

    fn event_elapsed_time(
        &self,
        start: RawEventHandle,
        end: RawEventHandle,
    ) -> DeviceResult<f32> {
        let mut ms: f32 = 0.0;
        let result =
            unsafe { ffi::hipEventElapsedTime(&mut ms, start as *mut _, end as *mut _) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::EventFailed(format!(
                "hipEventElapsedTime failed: {}",
                hip_error_string(result)
            )));
        }
        Ok(ms)
    }
}
