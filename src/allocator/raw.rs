//! Pass-through caching allocator
//!
//! No bins, no chunk table: every allocation goes straight to the device
//! and, once its guarding events complete, straight back. Shares the async
//! release pool contract with the best-fit allocator, which is the point:
//! deferred event-gated reclamation is independent of the caching policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::allocator::align::{DefaultAlignmentStrategy, MemoryAlignmentStrategy};
use crate::allocator::{CacheAllocator, DeviceMemHandle, ReleaseSink};
use crate::async_pool::AsyncMemPool;
use crate::device::{DeviceGuard, DeviceIndex, DevicePtr, DeviceStream, RawDevice};
use crate::error::MemForgeResult;
use crate::event::DeviceEvent;

struct RawState {
    device: Arc<dyn RawDevice>,
    device_index: DeviceIndex,
    align: Arc<dyn MemoryAlignmentStrategy>,
    // Pool aux is the requested size; the rounded size is recomputed on
    // drain for the reserved-byte accounting.
    pool: AsyncMemPool<usize>,
    pool_mutex: Mutex<()>,
    memory_allocated: AtomicUsize,
    memory_reserved: AtomicUsize,
}

impl RawState {
    fn lock_pool(&self) -> MutexGuard<'_, ()> {
        self.pool_mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocking drain: free every parked buffer to the device, yielding
    /// while the head entry's events are still in flight.
    fn empty_cache(&self) {
        let _lk = self.lock_pool();
        while !self.pool.empty() {
            if !self.pool.ready() {
                std::thread::yield_now();
                continue;
            }
            if let Some((ptr, size)) = self.pool.get() {
                let nbytes = self.align.round_bytes(size);
                let _guard = DeviceGuard::new(self.device.as_ref(), self.device_index);
                if let Err(e) = self.device.raw_deallocate(ptr) {
                    tracing::warn!("raw: release of {:p} failed: {}", ptr, e);
                }
                self.memory_reserved.fetch_sub(nbytes, Ordering::Relaxed);
            }
        }
    }
}

impl ReleaseSink for RawState {
    fn release(&self, ptr: DevicePtr, token: usize, nbytes: usize, streams: &[DeviceStream]) {
        if ptr.is_null() {
            return;
        }
        let mut events = Vec::with_capacity(streams.len());
        for stream in streams {
            let mut event = DeviceEvent::new(Arc::clone(&self.device));
            if let Err(e) = event.record(stream) {
                tracing::warn!("raw: failed to record release event: {}", e);
            }
            events.push(event);
        }
        self.pool.add((ptr, token), events);
        self.memory_allocated.fetch_sub(nbytes, Ordering::Relaxed);
    }
}

/// Uncached allocator with the deferred-release gate.
pub struct RawCachingAllocator {
    state: Arc<RawState>,
}

impl RawCachingAllocator {
    pub fn new(device: Arc<dyn RawDevice>, device_index: DeviceIndex) -> Self {
        Self::with_alignment(device, device_index, Arc::new(DefaultAlignmentStrategy))
    }

    pub fn with_alignment(
        device: Arc<dyn RawDevice>,
        device_index: DeviceIndex,
        align: Arc<dyn MemoryAlignmentStrategy>,
    ) -> Self {
        RawCachingAllocator {
            state: Arc::new(RawState {
                device,
                device_index,
                align,
                pool: AsyncMemPool::new(),
                pool_mutex: Mutex::new(()),
                memory_allocated: AtomicUsize::new(0),
                memory_reserved: AtomicUsize::new(0),
            }),
        }
    }

    /// Entries currently parked in the async release pool
    pub fn pending_releases(&self) -> usize {
        self.state.pool.size()
    }
}

impl CacheAllocator for RawCachingAllocator {
    fn allocate(&self, size: usize) -> MemForgeResult<DeviceMemHandle> {
        let state = &self.state;
        let nbytes = state.align.round_bytes(size);

        // Eager reclamation: nothing is cached here, so every allocate
        // first frees whatever the device has finished with.
        state.empty_cache();

        tracing::debug!("raw: allocating {} bytes ({} requested)", nbytes, size);
        let ptr = {
            let _guard = DeviceGuard::new(state.device.as_ref(), state.device_index);
            state.device.raw_allocate(nbytes)?
        };
        state.memory_reserved.fetch_add(nbytes, Ordering::Relaxed);
        state.memory_allocated.fetch_add(nbytes, Ordering::Relaxed);

        let stream = state.device.current_stream(state.device_index);
        let sink: Arc<dyn ReleaseSink> = state.clone();
        Ok(DeviceMemHandle::new(
            ptr,
            size,
            nbytes,
            size,
            vec![stream],
            Arc::downgrade(&sink),
        ))
    }

    fn empty_cache(&self) {
        self.state.empty_cache();
    }

    fn release_all_memory(&self) {
        self.empty_cache();
    }

    fn memory_allocated(&self) -> usize {
        self.state.memory_allocated.load(Ordering::Relaxed)
    }

    fn memory_reserved(&self) -> usize {
        self.state.memory_reserved.load(Ordering::Relaxed)
    }

    fn device_index(&self) -> DeviceIndex {
        self.state.device_index
    }
}
