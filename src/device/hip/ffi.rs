//! HIP FFI bindings
//!
//! FFI declarations below are bound to the ROCm HIP API, trimmed to the
//! memory/stream/event surface the allocators consume. The dead_code
//! allowance is needed because FFI symbols appear unused to the compiler
//! (they're only called through unsafe blocks).

use std::ffi::c_void;

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipGetDevice(deviceId: *mut i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipEventCreate(event: *mut *mut c_void) -> i32;
    pub fn hipEventCreateWithFlags(event: *mut *mut c_void, flags: u32) -> i32;
    pub fn hipEventDestroy(event: *mut c_void) -> i32;
    pub fn hipEventRecord(event: *mut c_void, stream: *mut c_void) -> i32;
    pub fn hipEventQuery(event: *mut c_void) -> i32;
    pub fn hipEventSynchronize(event: *mut c_void) -> i32;
    pub fn hipEventElapsedTime(ms: *mut f32, start: *mut c_void, end: *mut c_void) -> i32;
    pub fn hipStreamWaitEvent(stream: *mut c_void, event: *mut c_void, flags: u32) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const i8;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// Returned by `hipEventQuery` while captured work is still in flight
pub const HIP_ERROR_NOT_READY: i32 = 600;

/// Event flag to disable timing data collection
pub const HIP_EVENT_DISABLE_TIMING: u32 = 0x1;
