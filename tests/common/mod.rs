//! Common test utilities for the allocator suites
//!
//! All integration tests run against [`MockDevice`]: raw allocations are
//! opaque 512-aligned tokens carved from one contiguous cursor (so
//! physical-adjacency expectations are exact), and event readiness is
//! toggled by the test instead of real device completion.

// Each test binary compiles this module; not all of them use every helper.
#![allow(dead_code)]

use std::sync::Arc;

use memforge::{BFCachingAllocator, MockDevice, RawCachingAllocator};

pub const MIB: usize = 1 << 20;

/// Fresh mock device; events complete as soon as they are recorded.
pub fn mock_device() -> Arc<MockDevice> {
    Arc::new(MockDevice::new())
}

/// Best-fit allocator over `dev`, device index 0
pub fn bf_allocator(dev: &Arc<MockDevice>) -> BFCachingAllocator {
    BFCachingAllocator::new(dev.clone(), 0)
}

/// Pass-through allocator over `dev`, device index 0
pub fn raw_allocator(dev: &Arc<MockDevice>) -> RawCachingAllocator {
    RawCachingAllocator::new(dev.clone(), 0)
}
