//! State shared between timer interrupts and task context.

use core::cell::RefCell;

use critical_section::Mutex;

/// Value guarded by interrupt masking.
///
/// Every access happens inside a critical section, which on the MCU masks
/// interrupts for the duration of the closure. Keep closures short: they add
/// directly to interrupt latency.
pub struct IrqShared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> IrqShared<T> {
    /// Wraps `value`.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Runs `f` with exclusive access to the value.
    ///
    /// # Panics
    ///
    /// Panics if called re-entrantly from within `f` on the same value.
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    /// Consumes the wrapper and returns the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner().into_inner()
    }
}

impl<T: Default> Default for IrqShared<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
