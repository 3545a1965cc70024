//! Deterministic test device
//!
//! In-process [`RawDevice`] used by the allocator test suites. Allocations
//! are opaque 512-aligned tokens carved from one contiguous address cursor
//! (never dereferenced), so physical-adjacency expectations hold exactly.
//! Event readiness is under harness control: hold events back to model
//! kernels still running on a stream, release them to model completion.
//!
//! Shared fixture in the spirit of the GPU test commons: tests construct one
//! `Arc<MockDevice>` and drive both the allocator under test and the
//! readiness toggles through it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::device::{
    DeviceError, DeviceIndex, DevicePtr, DeviceResult, DeviceStream, DeviceType, EventStatus,
    RawDevice, RawEventHandle, RawStreamHandle,
};

const TOKEN_BASE: usize = 0x1000_0000;
const TOKEN_ALIGN: usize = 512;

#[derive(Debug)]
struct MockState {
    cursor: usize,
    live: HashMap<usize, usize>,
    alloc_calls: usize,
    dealloc_calls: usize,
    capacity: Option<usize>,
    in_use: usize,
    fail_next: usize,
    events: HashMap<RawEventHandle, bool>,
    next_event: RawEventHandle,
    events_ready_by_default: bool,
}

/// Mock implementation of [`RawDevice`] with harness controls.
#[derive(Debug)]
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Device whose events complete as soon as they are recorded.
    pub fn new() -> Self {
        MockDevice {
            state: Mutex::new(MockState {
                cursor: TOKEN_BASE,
                live: HashMap::new(),
                alloc_calls: 0,
                dealloc_calls: 0,
                capacity: None,
                in_use: 0,
                fail_next: 0,
                events: HashMap::new(),
                next_event: 1,
                events_ready_by_default: true,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Newly recorded events stay pending until [`release_events`] runs.
    ///
    /// [`release_events`]: MockDevice::release_events
    pub fn hold_events(&self) {
        self.lock().events_ready_by_default = false;
    }

    /// Complete every pending event and make future events complete on
    /// record.
    pub fn release_events(&self) {
        let mut st = self.lock();
        st.events_ready_by_default = true;
        for ready in st.events.values_mut() {
            *ready = true;
        }
    }

    /// Number of events currently recorded but not complete
    pub fn pending_events(&self) -> usize {
        self.lock().events.values().filter(|r| !**r).count()
    }

    /// Fail the next `n` raw allocations
    pub fn fail_next_allocations(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Cap total outstanding raw bytes; further allocations fail
    pub fn set_capacity(&self, bytes: Option<usize>) {
        self.lock().capacity = bytes;
    }

    /// Raw allocation calls so far
    pub fn alloc_calls(&self) -> usize {
        self.lock().alloc_calls
    }

    /// Raw deallocation calls so far
    pub fn dealloc_calls(&self) -> usize {
        self.lock().dealloc_calls
    }

    /// Raw extents currently outstanding
    pub fn live_allocations(&self) -> usize {
        self.lock().live.len()
    }

    /// Raw bytes currently outstanding
    pub fn live_bytes(&self) -> usize {
        self.lock().in_use
    }
}

impl RawDevice for MockDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Hip
    }

    fn current_device(&self) -> DeviceResult<DeviceIndex> {
        Ok(0)
    }

    fn set_device(&self, _index: DeviceIndex) -> DeviceResult<()> {
        Ok(())
    }

    fn current_stream(&self, device_index: DeviceIndex) -> DeviceStream {
        DeviceStream::new(0, device_index, 0)
    }

    fn raw_allocate(&self, nbytes: usize) -> DeviceResult<DevicePtr> {
        if nbytes == 0 {
            return Ok(DevicePtr::null());
        }
        let mut st = self.lock();
        st.alloc_calls += 1;
        if st.fail_next > 0 {
            st.fail_next -= 1;
            return Err(DeviceError::AllocationFailed(
                "injected allocation failure".to_string(),
            ));
        }
        if let Some(cap) = st.capacity {
            if st.in_use + nbytes > cap {
                return Err(DeviceError::AllocationFailed(format!(
                    "mock capacity exceeded: {} + {} > {}",
                    st.in_use, nbytes, cap
                )));
            }
        }
        let addr = st.cursor;
        debug_assert_eq!(addr % TOKEN_ALIGN, 0);
        st.cursor += (nbytes + TOKEN_ALIGN - 1) & !(TOKEN_ALIGN - 1);
        st.live.insert(addr, nbytes);
        st.in_use += nbytes;
        Ok(DevicePtr::new(addr as *mut _))
    }

    fn raw_deallocate(&self, ptr: DevicePtr) -> DeviceResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut st = self.lock();
        st.dealloc_calls += 1;
        let nbytes = st.live.remove(&(ptr.as_raw() as usize)).ok_or_else(|| {
            DeviceError::DeallocationFailed(format!("unknown mock pointer {:p}", ptr))
        })?;
        st.in_use -= nbytes;
        Ok(())
    }

    fn create_event(&self) -> DeviceResult<RawEventHandle> {
        let mut st = self.lock();
        let handle = st.next_event;
        st.next_event += 1;
        Ok(handle)
    }

    fn destroy_event(&self, event: RawEventHandle) -> DeviceResult<()> {
        self.lock().events.remove(&event);
        Ok(())
    }

    fn record_event(&self, event: RawEventHandle, _stream: RawStreamHandle) -> DeviceResult<()> {
        let mut st = self.lock();
        let ready = st.events_ready_by_default;
        st.events.insert(event, ready);
        Ok(())
    }

    fn event_status(&self, event: RawEventHandle) -> DeviceResult<EventStatus> {
        let st = self.lock();
        match st.events.get(&event) {
            Some(true) => Ok(EventStatus::Ready),
            Some(false) => Ok(EventStatus::NotReady),
            // Created but never recorded: nothing to wait for.
            None => Ok(EventStatus::Ready),
        }
    }

    fn wait_event(&self, event: RawEventHandle) -> DeviceResult<()> {
        loop {
            if self.event_status(event)? == EventStatus::Ready {
                return Ok(());
            }
            std::thread::yield_now();
        }
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
    fn test_tokens_are_contiguous_and_aligned() {
        let dev = MockDevice::new();
        let a = dev.raw_allocate(4096).unwrap();
        let b = dev.raw_allocate(512).unwrap();
        assert_eq!(a.as_raw() as usize % TOKEN_ALIGN, 0);
        assert_eq!(b.as_raw() as usize, a.as_raw() as usize + 4096);
        assert_eq!(dev.live_bytes(), 4608);
    }

    #[test]
    fn test_injected_failure() {
        let dev = MockDevice::new();
        dev.fail_next_allocations(1);
        assert!(dev.raw_allocate(512).is_err());
        assert!(dev.raw_allocate(512).is_ok());
    }

    #[test]
    fn test_capacity_cap() {
        let dev = MockDevice::new();
        dev.set_capacity(Some(1024));
        let a = dev.raw_allocate(1024).unwrap();
        assert!(dev.raw_allocate(512).is_err());
        dev.raw_deallocate(a).unwrap();
        assert!(dev.raw_allocate(512).is_ok());
    }

    #[test]
    fn test_event_hold_and_release() {
        let dev = MockDevice::new();
        dev.hold_events();
        let ev = dev.create_event().unwrap();
        dev.record_event(ev, 0).unwrap();
        assert_eq!(dev.event_status(ev).unwrap(), EventStatus::NotReady);
        assert_eq!(dev.pending_events(), 1);
        dev.release_events();
        assert_eq!(dev.event_status(ev).unwrap(), EventStatus::Ready);
    }

    #[test]
    fn test_unrecorded_event_is_ready() {
        let dev = MockDevice::new();
        dev.hold_events();
        let ev = dev.create_event().unwrap();
        assert_eq!(dev.event_status(ev).unwrap(), EventStatus::Ready);
    }
}
