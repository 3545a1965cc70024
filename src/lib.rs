//! MemForge - Caching Device-Memory Allocator
//!
//! A best-fit caching allocator for accelerator memory, sitting between a
//! host-side tensor runtime and the raw device-memory API. Device
//! allocations cost kernel launches and driver synchronization, so freed
//! buffers are cached and reused instead of returned; because the device
//! may still be executing work against a freed buffer, physical reuse is
//! deferred until the events recorded on its streams complete.

#![allow(clippy::collapsible_else_if)] // Sometimes clearer for control flow
#![allow(clippy::collapsible_if)] // Sometimes clearer for control flow
#![allow(clippy::type_complexity)] // Injected callback types are what they are

pub mod allocator;
pub mod async_pool;
pub mod device;
pub mod error;
pub mod event;
pub mod logging;

pub use allocator::{
    allocator_for, register_allocator, register_builtin_allocators, BFCachingAllocator,
    CacheAllocator, DefaultAlignmentStrategy, DeviceMemHandle, MemoryAlignmentStrategy,
    RawCachingAllocator, MIN_ALLOCATION_SIZE,
};
pub use async_pool::AsyncMemPool;
pub use device::{
    DeviceError, DeviceGuard, DeviceIndex, DevicePtr, DeviceResult, DeviceStream, DeviceType,
    EventStatus, HostDevice, MockDevice, RawDevice,
};
#[cfg(feature = "rocm")]
pub use device::HipDevice;
pub use error::{ErrorCategory, MemForgeError, MemForgeResult};
pub use event::DeviceEvent;
pub use logging::init_logging_default;
