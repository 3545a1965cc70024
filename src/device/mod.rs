//! Raw device interface
//!
//! Everything the allocators need from a device driver: raw byte
//! allocation, streams, and completion events. The `RawDevice` trait is the
//! seam between the caching layers and the actual driver; three
//! implementations live below it:
//!
//! - [`hip`] (feature `rocm`): AMD HIP over FFI
//! - [`host`]: plain host memory, events complete immediately
//! - [`mock`]: deterministic in-process device for tests

use std::ffi::c_void;
use std::fmt;
use std::ptr;

use thiserror::Error;

#[cfg(feature = "rocm")]
pub mod hip;
pub mod host;
pub mod mock;

#[cfg(feature = "rocm")]
pub use hip::HipDevice;
pub use host::HostDevice;
pub use mock::MockDevice;

/// Index of a device within its driver (0 for single-device systems)
pub type DeviceIndex = i32;

/// Opaque driver-side event handle
pub type RawEventHandle = usize;

/// Opaque driver-side stream handle (0 = the default stream)
pub type RawStreamHandle = usize;

/// Device error types
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),
    #[error("memory release failed: {0}")]
    DeallocationFailed(String),
    #[error("event operation failed: {0}")]
    EventFailed(String),
    #[error("stream operation failed: {0}")]
    StreamFailed(String),
    #[error("device selection failed: {0}")]
    DeviceSelectionFailed(String),
    #[error("invalid device index: {0}")]
    InvalidDevice(DeviceIndex),
}

/// Device result type
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Completion state of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ready,
    NotReady,
}

/// The kind of device an allocator is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Hip,
    Cpu,
}

/// A device address.
///
/// Thin copyable wrapper so device pointers can cross threads inside the
/// allocator bookkeeping. Never dereferenced by this crate; only the driver
/// (or the caller, through its own copies) touches the memory behind it.
// SAFETY: DevicePtr is a plain address. All accesses to the memory it names
// go through the driver; the allocator only stores and compares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(*mut c_void);

unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

impl DevicePtr {
    /// Wrap a raw device address
    pub fn new(ptr: *mut c_void) -> Self {
        DevicePtr(ptr)
    }

    /// The null address
    pub const fn null() -> Self {
        DevicePtr(ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Get the raw address back
    pub fn as_raw(&self) -> *mut c_void {
        self.0
    }

    /// Address `bytes` past this one (chunk splitting arithmetic)
    pub fn byte_add(&self, bytes: usize) -> Self {
        DevicePtr(((self.0 as usize).wrapping_add(bytes)) as *mut c_void)
    }
}

impl fmt::Pointer for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

/// A device stream, by value.
///
/// Stream lifetime is owned by the runtime above this crate; allocators only
/// need the identifying triple to record events and key bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStream {
    id: usize,
    device_index: DeviceIndex,
    raw: RawStreamHandle,
}

impl DeviceStream {
    pub fn new(id: usize, device_index: DeviceIndex, raw: RawStreamHandle) -> Self {
        DeviceStream {
            id,
            device_index,
            raw,
        }
    }

    /// Numeric stream id within its device
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn device_index(&self) -> DeviceIndex {
        self.device_index
    }

    /// Raw driver handle (for FFI calls)
    pub fn raw(&self) -> RawStreamHandle {
        self.raw
    }
}

/// Raw device API consumed by the caching allocators.
///
/// Mirrors the driver surface one-to-one: no caching, no pooling, no retry.
/// Implementations must be callable from any host thread.
pub trait RawDevice: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Current device for the calling thread
    fn current_device(&self) -> DeviceResult<DeviceIndex>;

    /// Make `index` the calling thread's current device
    fn set_device(&self, index: DeviceIndex) -> DeviceResult<()>;

    /// The stream new work on `device_index` is submitted to
    fn current_stream(&self, device_index: DeviceIndex) -> DeviceStream;

    /// Allocate `nbytes` of device memory. A zero-byte request returns the
    /// null address.
    fn raw_allocate(&self, nbytes: usize) -> DeviceResult<DevicePtr>;

    /// Release memory previously obtained from `raw_allocate`
    fn raw_deallocate(&self, ptr: DevicePtr) -> DeviceResult<()>;

    fn create_event(&self) -> DeviceResult<RawEventHandle>;

    fn destroy_event(&self, event: RawEventHandle) -> DeviceResult<()>;

    /// Capture the state of `stream` in `event`
    fn record_event(&self, event: RawEventHandle, stream: RawStreamHandle) -> DeviceResult<()>;

    fn event_status(&self, event: RawEventHandle) -> DeviceResult<EventStatus>;

    /// Block the host until `event` completes
    fn wait_event(&self, event: RawEventHandle) -> DeviceResult<()>;

    /// Make `stream` wait for `event` without blocking the host
    fn stream_wait_event(
        &self,
        stream: RawStreamHandle,
        event: RawEventHandle,
    ) -> DeviceResult<()>;

    /// Milliseconds between two completed events
    fn event_elapsed_time(
        &self,
        start: RawEventHandle,
        end: RawEventHandle,
    ) -> DeviceResult<f32>;
}

/// Scoped device selection.
///
/// Sets the calling thread's current device for the guard's lifetime and
/// restores the previous one on drop. Restoration failures are swallowed;
/// the guard is used inside destructors that must not panic.
pub struct DeviceGuard<'a> {
    device: &'a dyn RawDevice,
    prev: Option<DeviceIndex>,
}

impl<'a> DeviceGuard<'a> {
    pub fn new(device: &'a dyn RawDevice, index: DeviceIndex) -> Self {
        let prev = device.current_device().ok();
        if prev != Some(index) {
            if let Err(e) = device.set_device(index) {
                tracing::warn!("DeviceGuard: failed to select device {}: {}", index, e);
            }
        }
        DeviceGuard { device, prev }
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if let Some(prev) = self.prev {
            let _ = self.device.set_device(prev);
        }
    }
}
