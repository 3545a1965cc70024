//! Tests for the pass-through caching allocator
//!
//! Same release protocol as the best-fit allocator, no bin structure:
//! ready entries go straight back to the device, and every allocate drains
//! the pool first.

mod common;

use common::{mock_device, raw_allocator, MIB};
use memforge::{CacheAllocator, MemForgeError};

#[test]
fn test_allocate_rounds_and_counts() {
    let dev = mock_device();
    let raw = raw_allocator(&dev);

    let a = raw.allocate(1).unwrap();
    assert!(!a.is_null());
    assert_eq!(a.nbytes(), 512);
    assert_eq!(raw.memory_allocated(), 512);
    assert_eq!(raw.memory_reserved(), 512);
    assert_eq!(dev.alloc_calls(), 1);
}

#[test]
fn test_no_caching_between_allocations() {
    let dev = mock_device();
    let raw = raw_allocator(&dev);

    let a = raw.allocate(MIB).unwrap();
    drop(a);

    // The next allocate drains the pool first: the buffer goes back to the
    // device, then a fresh one is requested.
    let _b = raw.allocate(MIB).unwrap();
    assert_eq!(dev.alloc_calls(), 2);
    assert_eq!(dev.dealloc_calls(), 1);
    assert_eq!(raw.memory_reserved(), MIB);
}

#[test]
fn test_pending_event_delays_device_free() {
    let dev = mock_device();
    let raw = raw_allocator(&dev);

    dev.hold_events();
    let a = raw.allocate(MIB).unwrap();
    drop(a);
    assert_eq!(raw.pending_releases(), 1);
    assert_eq!(dev.dealloc_calls(), 0, "gated entry must not be freed");
    assert_eq!(raw.memory_reserved(), MIB);

    dev.release_events();
    raw.empty_cache();
    assert_eq!(dev.dealloc_calls(), 1);
    assert_eq!(raw.memory_reserved(), 0);
    assert_eq!(dev.live_bytes(), 0);
}

#[test]
fn test_empty_cache_drains_in_fifo_order() {
    let dev = mock_device();
    let raw = raw_allocator(&dev);

    let a = raw.allocate(MIB).unwrap();
    let b = raw.allocate(2 * MIB).unwrap();
    drop(a);
    drop(b);
    assert_eq!(raw.pending_releases(), 2);

    raw.empty_cache();
    assert_eq!(raw.pending_releases(), 0);
    assert_eq!(dev.dealloc_calls(), 2);
    assert_eq!(raw.memory_allocated(), 0);
    assert_eq!(raw.memory_reserved(), 0);
}

#[test]
fn test_zero_size_allocation() {
    let dev = mock_device();
    let raw = raw_allocator(&dev);

    let a = raw.allocate(0).unwrap();
    assert!(a.is_null());
    assert_eq!(raw.memory_allocated(), 0);
    drop(a);
    assert_eq!(raw.pending_releases(), 0);
}

#[test]
fn test_device_failure_propagates() {
    let dev = mock_device();
    let raw = raw_allocator(&dev);

    dev.fail_next_allocations(1);
    let err = raw.allocate(MIB).unwrap_err();
    assert!(matches!(err, MemForgeError::Device(_)));
    assert!(err.is_recoverable());
}

#[test]
fn test_release_all_memory_empties_pool() {
    let dev = mock_device();
    let raw = raw_allocator(&dev);

    let handles: Vec<_> = (0..4).map(|_| raw.allocate(MIB).unwrap()).collect();
    drop(handles);
    raw.release_all_memory();
    assert_eq!(dev.live_bytes(), 0);
    assert_eq!(raw.memory_reserved(), 0);
}
