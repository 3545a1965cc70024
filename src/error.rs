//! Unified error handling for MemForge
//!
//! A single crate-level error type with coarse categorization. Device-layer
//! failures carry their own `DeviceError` and convert into this type at the
//! allocator boundary.

use crate::device::{DeviceError, DeviceType};

/// Unified error type for MemForge
#[derive(Debug, thiserror::Error)]
pub enum MemForgeError {
    /// All reclamation attempts (pool drain, cache shrink) failed to satisfy
    /// the request. This is the only error `allocate` surfaces for OOM.
    #[error("no memory available")]
    NoMemoryAvailable,

    /// Underlying device API failure
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// No allocator registered under this (name, device type) pair
    #[error("no allocator registered as {0:?} for {1:?}")]
    AllocatorNotRegistered(String, DeviceType),

    /// Internal error (indicates a bug)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error category for handling decisions
///
/// - User: invalid input, actionable by the caller
/// - Recoverable: temporary condition, retry may succeed
/// - Backend: device/driver failure
/// - Internal: a bug; report it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    User,
    Recoverable,
    Backend,
    Internal,
}

impl MemForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            MemForgeError::NoMemoryAvailable => ErrorCategory::Recoverable,
            MemForgeError::Device(_) => ErrorCategory::Backend,
            MemForgeError::AllocatorNotRegistered(_, _) => ErrorCategory::User,
            MemForgeError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is a temporary condition worth retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Backend
        )
    }

    /// Check if this error indicates a bug
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Crate result type
pub type MemForgeResult<T> = Result<T, MemForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_is_recoverable() {
        assert!(MemForgeError::NoMemoryAvailable.is_recoverable());
        assert_eq!(
            MemForgeError::NoMemoryAvailable.category(),
            ErrorCategory::Recoverable
        );
    }

    #[test]
    fn test_device_error_converts() {
        let err: MemForgeError =
            DeviceError::AllocationFailed("out of device memory".to_string()).into();
        assert_eq!(err.category(), ErrorCategory::Backend);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_internal_error_category() {
        let err = MemForgeError::Internal("chunk table corrupted".to_string());
        assert!(err.is_internal_error());
        assert!(!err.is_recoverable());
    }
}
