//! Safe global initialization without `static mut`.
//!
//! [`OnceLock`] is a write-once cell for values that live for the rest of
//! the kernel's lifetime (boot artifacts, controller tables). [`GlobalState`]
//! wraps mutable singletons behind a spinlock with explicit
//! initialized/uninitialized states.

use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

/// A cell that can be written exactly once.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    /// Create a new empty cell.
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer was stored by `set()` from
            // `Box::into_raw()`, so it refers to a valid leaked `T`. The
            // Acquire load synchronizes-with the Release store in `set()`,
            // so the pointee is fully initialized before we read it.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns `Err(value)` if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(value));

        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` came from `Box::into_raw` above and lost the
                // race, so no other owner exists; reclaim it to return the
                // value to the caller.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }
}

// SAFETY: The inner value is heap-allocated and published through an
// AtomicPtr with Acquire/Release ordering; ownership transfer is sound
// whenever T itself is Send.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: `set()` uses compare_exchange so at most one initialization
// succeeds, and `get()` hands out shared references only; T must be Sync
// because multiple CPUs may hold those references concurrently.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: We have `&mut self`, so no other reference to the
            // leaked allocation can exist; reconstructing the Box reclaims
            // it.
            unsafe {
                let _ = alloc::boxed::Box::from_raw(ptr);
            }
        }
    }
}

/// Spinlocked global singleton with an explicit uninitialized state.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state. Returns `Err(value)` when already set.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    /// Run a closure over a shared reference to the value, if initialized.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let lock = self.inner.lock();
        lock.as_ref().map(f)
    }

    /// Run a closure over a mutable reference to the value, if initialized.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut lock = self.inner.lock();
        lock.as_mut().map(f)
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: All access to the inner Option<T> is serialized by the spinlock,
// so sharing the wrapper across CPUs cannot race; T: Send suffices because
// the lock guarantees exclusive access per holder.
unsafe impl<T: Send> Send for GlobalState<T> {}
// SAFETY: Same argument as Send; the Mutex serializes every access path.
unsafe impl<T: Send> Sync for GlobalState<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_lock_single_init() {
        let lock = OnceLock::new();
        assert!(lock.get().is_none());
        assert!(lock.set(42).is_ok());
        assert_eq!(*lock.get().unwrap(), 42);
        assert_eq!(lock.set(100), Err(100));
        assert_eq!(*lock.get().unwrap(), 42);
    }

    #[test]
    fn test_global_state_lifecycle() {
        let state: GlobalState<u64> = GlobalState::new();
        assert!(state.with(|_| ()).is_none());
        assert!(state.init(7).is_ok());
        assert_eq!(state.with(|v| *v), Some(7));
        state.with_mut(|v| *v += 1);
        assert_eq!(state.with(|v| *v), Some(8));
        assert_eq!(state.init(9), Err(9));
    }
}
