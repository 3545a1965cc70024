//! Best-fit caching allocator facade
//!
//! Layers the async release pool over the best-fit core and owns the
//! escalation policy when the device runs dry: drain what is already
//! complete, then wait the pool out, then shrink the cache, and only then
//! report out-of-memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::allocator::align::{DefaultAlignmentStrategy, MemoryAlignmentStrategy};
use crate::allocator::bfc_core::BFCachingAllocatorImpl;
use crate::allocator::{CacheAllocator, DeviceMemHandle, ReleaseSink};
use crate::async_pool::AsyncMemPool;
use crate::device::{DeviceGuard, DeviceIndex, DevicePtr, DeviceStream, RawDevice};
use crate::error::{MemForgeError, MemForgeResult};
use crate::event::DeviceEvent;

/// Pool length past which allocate tries a bounded drain before proceeding
const MAX_ASYNC_POOL_LENGTH: usize = 96;

/// Budget for that bounded drain
const MAX_DRAIN_WAIT: Duration = Duration::from_micros(32);

struct BFState {
    device: Arc<dyn RawDevice>,
    device_index: DeviceIndex,
    align: Arc<dyn MemoryAlignmentStrategy>,
    core: OnceCell<BFCachingAllocatorImpl>,
    // Pool aux is the chunk id of the released buffer.
    pool: AsyncMemPool<usize>,
    // Serializes the multi-step drain paths; individual pool operations
    // are already thread-safe.
    pool_mutex: Mutex<()>,
    memory_allocated: AtomicUsize,
    memory_reserved: AtomicUsize,
}

impl BFState {
    /// The core, constructed on first use with this device as its
    /// raw-memory source. Raw failures surface as `None` so the core
    /// reports "no memory" instead of unwinding through the spin lock.
    fn core(&self) -> &BFCachingAllocatorImpl {
        self.core.get_or_init(|| {
            let index = self.device_index;
            let alloc_device = Arc::clone(&self.device);
            let dealloc_device = Arc::clone(&self.device);
            BFCachingAllocatorImpl::new(
                Box::new(move |nbytes| {
                    let _guard = DeviceGuard::new(alloc_device.as_ref(), index);
                    match alloc_device.raw_allocate(nbytes) {
                        Ok(ptr) => Some(ptr),
                        Err(e) => {
                            tracing::debug!("raw allocation of {} bytes failed: {}", nbytes, e);
                            None
                        }
                    }
                }),
                Box::new(move |ptr| {
                    let _guard = DeviceGuard::new(dealloc_device.as_ref(), index);
                    if let Err(e) = dealloc_device.raw_deallocate(ptr) {
                        tracing::warn!("raw release of {:p} failed: {}", ptr, e);
                    }
                }),
            )
        })
    }

    fn lock_pool(&self) -> MutexGuard<'_, ()> {
        self.pool_mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_reserved(&self) {
        self.memory_reserved
            .store(self.core().memory_reserved(), Ordering::Relaxed);
    }

    /// Feed every already-complete pool entry back into the core
    fn restore(&self) {
        let _lk = self.lock_pool();
        while self.pool.ready() {
            if let Some((ptr, id)) = self.pool.get() {
                tracing::debug!(
                    "bf: restoring {:p} (chunk {}), pool size {}",
                    ptr,
                    id,
                    self.pool.size()
                );
                self.core().release_raw(ptr, id);
            }
        }
        self.refresh_reserved();
    }

    /// Drain the pool to empty, yielding while the head entry's events are
    /// still in flight
    fn empty_resource_pool(&self) {
        let _lk = self.lock_pool();
        while !self.pool.empty() {
            if !self.pool.ready() {
                std::thread::yield_now();
                continue;
            }
            if let Some((ptr, id)) = self.pool.get() {
                self.core().release_raw(ptr, id);
            }
        }
    }

    /// Like `empty_resource_pool`, but gives up once the wait budget is
    /// spent. Returns whether the pool was fully drained.
    fn try_empty_resource_pool(&self) -> bool {
        let _lk = self.lock_pool();
        let start = Instant::now();
        while !self.pool.empty() {
            if !self.pool.ready() {
                if start.elapsed() < MAX_DRAIN_WAIT {
                    std::thread::yield_now();
                    continue;
                }
                return false;
            }
            if let Some((ptr, id)) = self.pool.get() {
                self.core().release_raw(ptr, id);
            }
        }
        true
    }

    fn empty_cache(&self) {
        self.empty_resource_pool();
        self.core().empty_cache();
        self.refresh_reserved();
    }
}

impl ReleaseSink for BFState {
    fn release(&self, ptr: DevicePtr, token: usize, nbytes: usize, streams: &[DeviceStream]) {
        if ptr.is_null() {
            return;
        }
        let mut events = Vec::with_capacity(streams.len());
        for stream in streams {
            let mut event = DeviceEvent::new(Arc::clone(&self.device));
            if let Err(e) = event.record(stream) {
                tracing::warn!("bf: failed to record release event: {}", e);
            }
            events.push(event);
        }
        tracing::debug!(
            "bf: queueing {:p} (chunk {}) behind {} event(s)",
            ptr,
            token,
            events.len()
        );
        self.pool.add((ptr, token), events);
        self.memory_allocated.fetch_sub(nbytes, Ordering::Relaxed);
    }
}

/// Best-fit caching allocator for one device.
pub struct BFCachingAllocator {
    state: Arc<BFState>,
}

impl BFCachingAllocator {
    pub fn new(device: Arc<dyn RawDevice>, device_index: DeviceIndex) -> Self {
        Self::with_alignment(device, device_index, Arc::new(DefaultAlignmentStrategy))
    }

    pub fn with_alignment(
        device: Arc<dyn RawDevice>,
        device_index: DeviceIndex,
        align: Arc<dyn MemoryAlignmentStrategy>,
    ) -> Self {
        BFCachingAllocator {
            state: Arc::new(BFState {
                device,
                device_index,
                align,
                core: OnceCell::new(),
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

impl CacheAllocator for BFCachingAllocator {
    fn allocate(&self, size: usize) -> MemForgeResult<DeviceMemHandle> {
        let state = &self.state;
        let core = state.core();

        state.restore();
        if state.pool.size() > MAX_ASYNC_POOL_LENGTH {
            state.try_empty_resource_pool();
        }

        let size = state.align.round_bytes(size);
        let mut block = core.allocate_raw(size);
        if block.ptr.is_null() && size > 0 {
            // Escalate: wait the pool out, then give the cache back, and
            // only then declare the device exhausted.
            state.empty_resource_pool();
            block = core.allocate_raw(size);
            if block.ptr.is_null() {
                state.empty_cache();
                block = core.allocate_raw(size);
                if block.ptr.is_null() {
                    return Err(MemForgeError::NoMemoryAvailable);
                }
            }
        }

        state
            .memory_allocated
            .fetch_add(block.nbytes, Ordering::Relaxed);
        state.refresh_reserved();

        tracing::debug!(
            "bf: allocated {} bytes ({} requested) at {:p}, pool size {}",
            block.nbytes,
            size,
            block.ptr,
            state.pool.size()
        );

        let stream = state.device.current_stream(state.device_index);
        let sink: Arc<dyn ReleaseSink> = state.clone();
        Ok(DeviceMemHandle::new(
            block.ptr,
            size,
            block.nbytes,
            block.id,
            vec![stream],
            Arc::downgrade(&sink),
        ))
    }

    fn empty_cache(&self) {
        self.state.empty_cache();
    }

    fn release_all_memory(&self) {
        // Nothing to give back if the core never came up.
        if self.state.core.get().is_some() {
            self.state.empty_cache();
        }
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

impl Drop for BFCachingAllocator {
    fn drop(&mut self) {
        self.release_all_memory();
    }
}
