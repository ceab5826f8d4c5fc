//! Shared-memory primitives used throughout the runtime
//!
//! Worker threads share the global tables and any storage reachable through
//! pointers, so the reference-counted pointer type is atomic and mutable
//! cells are lock-backed with borrow checking at runtime.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A reference-counted pointer to a value in allocated memory
pub type Ptr<T> = Arc<T>;

/// A mutable value with borrowing checked at runtime
#[derive(Debug, Default)]
pub struct VmCell<T: ?Sized>(RwLock<T>);

impl<T> From<T> for VmCell<T> {
    fn from(value: T) -> Self {
        Self(RwLock::from(value))
    }
}

impl<T: ?Sized> VmCell<T> {
    /// Immutably borrows the wrapped value
    ///
    /// Multiple immutable borrows can be made at the same time. If the value
    /// is currently mutably borrowed then this call blocks.
    pub fn borrow(&self) -> Borrow<'_, T> {
        Borrow(self.0.read())
    }

    /// Mutably borrows the wrapped value
    ///
    /// If the value is currently borrowed then this call blocks until the
    /// borrow is released.
    pub fn borrow_mut(&self) -> BorrowMut<'_, T> {
        BorrowMut(self.0.write())
    }

    /// Attempts to mutably borrow the wrapped value without blocking
    pub fn try_borrow_mut(&self) -> Option<BorrowMut<'_, T>> {
        self.0.try_write().map(BorrowMut)
    }
}

/// An immutably borrowed reference to a value borrowed from a [VmCell]
pub struct Borrow<'a, T: ?Sized>(RwLockReadGuard<'a, T>);

impl<T: ?Sized> std::ops::Deref for Borrow<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

/// A mutably borrowed reference to a value borrowed from a [VmCell]
pub struct BorrowMut<'a, T: ?Sized>(RwLockWriteGuard<'a, T>);

impl<T: ?Sized> std::ops::Deref for BorrowMut<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> std::ops::DerefMut for BorrowMut<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
