//! Caching allocators for device memory
//!
//! Two facades share one release protocol: buffers freed by the host are
//! parked in an async release pool until the device events recorded on
//! their streams complete, and only then handed back to the underlying
//! strategy. [`BFCachingAllocator`] feeds reclaimed buffers into a best-fit
//! bin structure; [`RawCachingAllocator`] frees them straight to the
//! device.

pub mod align;
pub mod bfc;
mod bfc_core;
pub mod raw;
pub mod registry;
pub mod spin;

pub use align::{DefaultAlignmentStrategy, MemoryAlignmentStrategy, MIN_ALLOCATION_SIZE};
pub use bfc::BFCachingAllocator;
pub use raw::RawCachingAllocator;
pub use registry::{allocator_for, register_allocator, register_builtin_allocators};
pub use spin::SpinMutex;

use std::sync::{Mutex, Weak};

use crate::device::{DeviceIndex, DevicePtr, DeviceStream};
use crate::error::MemForgeResult;

/// Public surface shared by the caching allocators. One instance serves one
/// device; registration (see [`registry`]) picks the implementation per
/// device type.
pub trait CacheAllocator: Send + Sync {
    /// Allocate `size` bytes of device memory behind a scoped handle.
    ///
    /// The handle releases on every exit path, but release is deferred: the
    /// buffer only becomes reusable once every stream recorded on the
    /// handle has finished the work submitted before the release.
    fn allocate(&self, size: usize) -> MemForgeResult<DeviceMemHandle>;

    /// Synchronously drain the release pool and return cached extents to
    /// the device.
    fn empty_cache(&self);

    /// Shutdown path: give back everything this allocator still caches.
    fn release_all_memory(&self);

    /// Bytes currently handed out to callers
    fn memory_allocated(&self) -> usize;

    /// Bytes currently held from the device (allocated + cached)
    fn memory_reserved(&self) -> usize;

    fn device_index(&self) -> DeviceIndex;
}

/// Where a handle returns its buffer on drop. Implemented by the facades'
/// shared state; handles hold it weakly so they survive allocator teardown.
pub(crate) trait ReleaseSink: Send + Sync {
    fn release(&self, ptr: DevicePtr, token: usize, nbytes: usize, streams: &[DeviceStream]);
}

/// Scoped device allocation.
///
/// Dropping the handle records one event per associated stream and queues
/// the buffer for deferred reuse. If the owning allocator is already gone
/// the release is skipped; the memory goes down with the allocator.
pub struct DeviceMemHandle {
    ptr: DevicePtr,
    size: usize,
    nbytes: usize,
    token: usize,
    streams: Mutex<Vec<DeviceStream>>,
    owner: Weak<dyn ReleaseSink>,
}

impl DeviceMemHandle {
    pub(crate) fn new(
        ptr: DevicePtr,
        size: usize,
        nbytes: usize,
        token: usize,
        streams: Vec<DeviceStream>,
        owner: Weak<dyn ReleaseSink>,
    ) -> Self {
        DeviceMemHandle {
            ptr,
            size,
            nbytes,
            token,
            streams: Mutex::new(streams),
            owner,
        }
    }

    /// Device address of the buffer (null for zero-byte allocations)
    pub fn ptr(&self) -> *mut std::ffi::c_void {
        self.ptr.as_raw()
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Requested size in bytes, after facade rounding
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes actually reserved for this allocation
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Allocator bookkeeping token. For the best-fit allocator this is the
    /// chunk id (never 0 for a real allocation).
    pub fn token(&self) -> usize {
        self.token
    }

    /// Associate a stream with this buffer. The release waits for every
    /// associated stream; the runtime calls this when it launches work
    /// touching the buffer on a stream other than the allocating one.
    pub fn record_stream(&self, stream: DeviceStream) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if !streams.contains(&stream) {
            streams.push(stream);
        }
    }

    /// Streams whose completion gates the buffer's reuse
    pub fn streams(&self) -> Vec<DeviceStream> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for DeviceMemHandle {
    fn drop(&mut self) {
        match self.owner.upgrade() {
            Some(owner) => {
                let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
                owner.release(self.ptr, self.token, self.nbytes, &streams);
            }
            None => {
                tracing::debug!(
                    "buffer {:p} released after its allocator was torn down; skipping",
                    self.ptr
                );
            }
        }
    }
}

impl std::fmt::Debug for DeviceMemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemHandle")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("nbytes", &self.nbytes)
            .field("token", &self.token)
            .finish()
    }
}
