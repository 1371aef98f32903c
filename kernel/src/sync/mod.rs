//! Synchronization primitives shared by the core subsystems.
//!
//! Locks are `spin` crate TTAS spinlocks throughout; this module adds the
//! safe-global patterns built on top of them.

pub mod once_lock;

pub use once_lock::{GlobalState, OnceLock};
