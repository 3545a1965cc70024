//! Allocator registry dispatch tests
//!
//! The registry is process-global, so these tests run serially.

mod common;

use std::sync::Arc;

use common::{mock_device, MIB};
use memforge::{
    allocator_for, register_allocator, register_builtin_allocators, CacheAllocator,
    DeviceIndex, DeviceType, HostDevice, MemForgeError, RawCachingAllocator, RawDevice,
};
use serial_test::serial;

#[test]
#[serial]
fn test_builtin_allocators_dispatch() {
    register_builtin_allocators();

    // The mock reports the GPU device type.
    let dev = mock_device();
    let bf = allocator_for("BF", dev.clone(), 0).unwrap();
    let a = bf.allocate(MIB).unwrap();
    assert!(!a.is_null());
    // Best-fit behavior: the whole first extent is reserved.
    assert_eq!(bf.memory_reserved(), 8 * MIB);
    drop(a);
    bf.empty_cache();

    // Same strategies are registered for the host device type.
    let host = Arc::new(HostDevice::new());
    let raw = allocator_for("RAW", host, 0).unwrap();
    let b = raw.allocate(MIB).unwrap();
    // Pass-through behavior: exactly the rounded request is reserved.
    assert_eq!(raw.memory_reserved(), MIB);
    drop(b);
    raw.empty_cache();
}

#[test]
#[serial]
fn test_unregistered_name_errors() {
    register_builtin_allocators();
    let dev = mock_device();
    let err = match allocator_for("BESPOKE", dev, 0) {
        Ok(_) => panic!("expected AllocatorNotRegistered error"),
        Err(e) => e,
    };
    assert!(matches!(err, MemForgeError::AllocatorNotRegistered(_, _)));
}

#[test]
#[serial]
fn test_custom_registration_overrides() {
    fn custom_factory(
        device: Arc<dyn RawDevice>,
        index: DeviceIndex,
    ) -> Arc<dyn CacheAllocator> {
        Arc::new(RawCachingAllocator::new(device, index))
    }

    register_builtin_allocators();
    register_allocator("BF", DeviceType::Cpu, custom_factory);

    let host = Arc::new(HostDevice::new());
    let alloc = allocator_for("BF", host, 0).unwrap();
    let a = alloc.allocate(MIB).unwrap();
    // The override is pass-through: no 8 MiB extent.
    assert_eq!(alloc.memory_reserved(), MIB);
    drop(a);
    alloc.empty_cache();

    // Restore the builtin mapping for other tests.
    register_builtin_allocators();
}
