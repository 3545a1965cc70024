//! Async release pool
//!
//! FIFO of freed buffers waiting for device completion. A freed buffer is
//! queued together with the events recorded on every stream that touched
//! it; the entry is ready for reuse only once all of those events report
//! complete. Which allocator the buffer returns to is the caller's concern:
//! the best-fit allocator feeds chunks back into its bins, the raw
//! allocator frees straight to the device.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::device::DevicePtr;
use crate::event::DeviceEvent;

struct PoolEntry<A> {
    ptr: DevicePtr,
    aux: A,
    events: Vec<DeviceEvent>,
}

/// FIFO of `(buffer, aux, events)` entries gated on event completion.
///
/// `aux` is whatever bookkeeping the owning allocator needs to reclaim the
/// buffer: the best-fit allocator stores the chunk id, the raw allocator
/// the requested size.
///
/// Individual operations are thread-safe; multi-step drain patterns
/// (check-ready-then-pop loops) need an external lock, which the facades
/// hold around their drain paths.
pub struct AsyncMemPool<A> {
    queue: Mutex<VecDeque<PoolEntry<A>>>,
}

impl<A> Default for AsyncMemPool<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> AsyncMemPool<A> {
    pub fn new() -> Self {
        AsyncMemPool {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PoolEntry<A>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an entry; O(1).
    pub fn add(&self, entry: (DevicePtr, A), events: Vec<DeviceEvent>) {
        let (ptr, aux) = entry;
        self.lock().push_back(PoolEntry { ptr, aux, events });
    }

    pub fn empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// True iff the head entry exists and all of its events are complete
    pub fn ready(&self) -> bool {
        let queue = self.lock();
        match queue.front() {
            Some(entry) => entry.events.iter().all(|e| e.query()),
            None => false,
        }
    }

    /// Pop the head entry. Callers check [`ready`] first; the events are
    /// dropped (and the raw events destroyed) here.
    ///
    /// [`ready`]: AsyncMemPool::ready
    pub fn get(&self) -> Option<(DevicePtr, A)> {
        self.lock().pop_front().map(|entry| (entry.ptr, entry.aux))
    }
}
