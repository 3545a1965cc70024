//! Allocator registry
//!
//! Maps `(name, device type)` to an allocator factory so the host can pick
//! the caching strategy per device at startup. Population is explicit:
//! call [`register_builtin_allocators`] (or [`register_allocator`] for
//! custom strategies) during initialization, then build instances through
//! [`allocator_for`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::allocator::{BFCachingAllocator, CacheAllocator, RawCachingAllocator};
use crate::device::{DeviceIndex, DeviceType, RawDevice};
use crate::error::{MemForgeError, MemForgeResult};

/// Builds one allocator instance for one device
pub type AllocatorFactory = fn(Arc<dyn RawDevice>, DeviceIndex) -> Arc<dyn CacheAllocator>;

static REGISTRY: Lazy<RwLock<HashMap<(String, DeviceType), AllocatorFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn bf_factory(device: Arc<dyn RawDevice>, index: DeviceIndex) -> Arc<dyn CacheAllocator> {
    Arc::new(BFCachingAllocator::new(device, index))
}

fn raw_factory(device: Arc<dyn RawDevice>, index: DeviceIndex) -> Arc<dyn CacheAllocator> {
    Arc::new(RawCachingAllocator::new(device, index))
}

/// Publish `factory` under `(name, device_type)`, replacing any previous
/// registration under the same key.
pub fn register_allocator(name: &str, device_type: DeviceType, factory: AllocatorFactory) {
    tracing::debug!("registering allocator {:?} for {:?}", name, device_type);
    REGISTRY
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert((name.to_string(), device_type), factory);
}

/// Register the built-in strategies ("BF" best-fit, "RAW" pass-through)
/// for both device types. Idempotent; call once at startup.
pub fn register_builtin_allocators() {
    for device_type in [DeviceType::Hip, DeviceType::Cpu] {
        register_allocator("BF", device_type, bf_factory);
        register_allocator("RAW", device_type, raw_factory);
    }
}

/// Build the allocator registered under `name` for the type of `device`.
pub fn allocator_for(
    name: &str,
    device: Arc<dyn RawDevice>,
    index: DeviceIndex,
) -> MemForgeResult<Arc<dyn CacheAllocator>> {
    let device_type = device.device_type();
    let factory = REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&(name.to_string(), device_type))
        .copied()
        .ok_or_else(|| MemForgeError::AllocatorNotRegistered(name.to_string(), device_type))?;
    Ok(factory(device, index))
}

/// Keys currently registered, for diagnostics
pub fn registered_allocators() -> Vec<(String, DeviceType)> {
    REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .cloned()
        .collect()
}
