//! Kernel-wide error types.
//!
//! Every fallible core operation returns [`KernelResult`]. The variants map
//! one-to-one onto the failure classes the core actually produces: allocator
//! exhaustion, caller precondition violations, hardware refusals and
//! timeouts, namespace errors surfaced from the in-memory VFS, and teardown
//! rejection.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// An allocator (frame, heap, IO heap, or vector pool) is exhausted.
    OutOfMemory {
        requested: usize,
    },
    /// The caller violated a precondition: null pointer, misaligned size,
    /// out-of-range index.
    InvalidParameter {
        name: &'static str,
    },
    /// Hardware negative acknowledgment or hardware timeout.
    DeviceError {
        device: &'static str,
        code: u32,
    },
    /// Named object does not exist.
    NotFound {
        resource: &'static str,
    },
    /// Named object already exists (double initialization included).
    AlreadyExists {
        resource: &'static str,
    },
    /// Index or offset beyond the end of the addressed object.
    OutOfBounds {
        index: usize,
        limit: usize,
    },
    /// The object has been marked for teardown; no new operations accepted.
    Unavailable,
    /// A blocking protocol operation exceeded its deadline.
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },
    /// Subsystem used before its `init()` ran.
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidParameter { name } => write!(f, "Invalid parameter: {}", name),
            Self::DeviceError { device, code } => {
                write!(f, "Device error on {}: code {:#x}", device, code)
            }
            Self::NotFound { resource } => write!(f, "{} not found", resource),
            Self::AlreadyExists { resource } => write!(f, "{} already exists", resource),
            Self::OutOfBounds { index, limit } => {
                write!(f, "Index {} out of bounds (limit {})", index, limit)
            }
            Self::Unavailable => write!(f, "Object is marked unavailable"),
            Self::Timeout {
                operation,
                duration_ms,
            } => write!(f, "Timeout during {}: {} ms", operation, duration_ms),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = KernelError::Timeout {
            operation: "xHCI command",
            duration_ms: 200,
        };
        let mut buf = alloc::string::String::new();
        core::fmt::write(&mut buf, format_args!("{}", err)).unwrap();
        assert!(buf.contains("xHCI command"));
        assert!(buf.contains("200"));
    }

    #[test]
    fn test_errors_are_comparable() {
        assert_eq!(KernelError::Unavailable, KernelError::Unavailable);
        assert_ne!(
            KernelError::NotFound { resource: "task" },
            KernelError::NotFound { resource: "timer" }
        );
    }
}
