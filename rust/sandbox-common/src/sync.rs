//! Bounds and shared state that mean different things per target.
//!
//! In a browser there is exactly one thread, so nothing needs to be `Send`
//! and a `RefCell` is enough to share state between event callbacks. On
//! native targets the same types are driven by tokio, where spawned futures
//! must be `Send` and shared state needs a lock. [`ConditionalSend`],
//! [`ConditionalSync`] and [`SharedCell`] pick the right one at compile time.

#[allow(missing_docs)]
#[cfg(not(target_arch = "wasm32"))]
pub trait ConditionalSend: Send {}

#[cfg(not(target_arch = "wasm32"))]
impl<S> ConditionalSend for S where S: Send {}

#[allow(missing_docs)]
#[cfg(not(target_arch = "wasm32"))]
pub trait ConditionalSync: Send + Sync {}

#[cfg(not(target_arch = "wasm32"))]
impl<S> ConditionalSync for S where S: Send + Sync {}

#[allow(missing_docs)]
#[cfg(target_arch = "wasm32")]
pub trait ConditionalSend {}

#[cfg(target_arch = "wasm32")]
impl<S> ConditionalSend for S {}

#[allow(missing_docs)]
#[cfg(target_arch = "wasm32")]
pub trait ConditionalSync {}

#[cfg(target_arch = "wasm32")]
impl<S> ConditionalSync for S {}

/// Interior mutability that is a `Mutex` natively and a `RefCell` in the
/// browser.
///
/// Guards must never be held across an `.await`; callers copy what they need
/// out of the cell and release it before suspending.
///
/// ```
/// use sandbox_common::SharedCell;
///
/// let cell = SharedCell::new(vec![1]);
/// cell.lock().push(2);
/// assert_eq!(cell.with(|items| items.len()), 2);
/// ```
#[derive(Debug, Default)]
pub struct SharedCell<T> {
    #[cfg(not(target_arch = "wasm32"))]
    inner: std::sync::Mutex<T>,

    #[cfg(target_arch = "wasm32")]
    inner: std::cell::RefCell<T>,
}

#[cfg(not(target_arch = "wasm32"))]
impl<T> SharedCell<T> {
    /// Wraps `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(value),
        }
    }

    /// Exclusive access to the value.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.inner.lock().expect("shared cell poisoned")
    }
}

#[cfg(target_arch = "wasm32")]
impl<T> SharedCell<T> {
    /// Wraps `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: std::cell::RefCell::new(value),
        }
    }

    /// Exclusive access to the value.
    ///
    /// # Panics
    /// Panics if the value is already borrowed, which only happens when a
    /// guard is kept alive while re-entering the owner.
    pub fn lock(&self) -> std::cell::RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}

impl<T> SharedCell<T> {
    /// Runs `f` with exclusive access and returns its result, releasing the
    /// cell before returning.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}
