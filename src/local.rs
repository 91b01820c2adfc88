//! Lazily initialized, owning thread-local cells
//!
//! A `ThreadLocal` holds one value per thread. The first access on each thread
//! runs the cell's initializer and stores the result in that thread's OS TLS
//! slot; every later access on the same thread sees that same value. When the
//! thread exits, the value is dropped on that thread.
//!
//! The cell itself is just a handle: it can be shared between threads by
//! reference or cloned, and dropping it doesn't destroy any thread's value.
//! Those are still dropped when their threads exit.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::thread;
//!
//! use threadly::ThreadLocal;
//!
//! let cell = ThreadLocal::new(|| RefCell::new(vec![1, 2, 3]));
//!
//! cell.with(|v| v.borrow_mut().push(4));
//! assert_eq!(cell.with(|v| v.borrow().len()), 4);
//!
//! // each thread starts out with its own fresh vector
//! thread::scope(|s| {
//!     s.spawn(|| assert_eq!(cell.with(|v| v.borrow().len()), 3));
//! });
//!
//! // and ours was left alone
//! assert_eq!(cell.with(|v| v.borrow().len()), 4);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::Arc;

use crate::error::{AccessError, BoxError};
use crate::os;

type Init<T> = Box<dyn Fn() -> Result<T, BoxError> + Send + Sync>;

/// A value per thread, created lazily on each thread's first access and
/// dropped when that thread exits.
///
/// Values never move between threads, so `T` doesn't need to be `Send` or
/// `Sync` for the cell to be shared.
///
/// # Initialization
///
/// The initializer runs at most once per thread, on that thread, the first
/// time any accessor is used there. If it fails (or panics) nothing is stored
/// and the next access tries again.
///
/// An initializer must not access the cell it is initializing; such an access
/// fails with [`AccessError::Reentrant`].
///
/// # Destruction
///
/// A thread's value is dropped when the thread exits through its normal exit
/// path. Threads torn down some other way (a forced kill, `exit` in another
/// thread) may never drop their values. Drop order across different cells is
/// up to the platform.
///
/// Accessing a cell from its own value's destructor, or from another
/// thread-local destructor later in the same teardown pass, fails with
/// [`AccessError::Destroyed`]. With pthread keys a destructor running in a
/// later pass may find the cell uninitialized again; a value created then is
/// only dropped if the platform runs yet another pass. A panic escaping a
/// destructor run at thread exit aborts the process.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// use threadly::ThreadLocal;
///
/// let calls = Arc::new(AtomicUsize::new(0));
/// let counter = calls.clone();
/// let cell = ThreadLocal::new(move || {
///     counter.fetch_add(1, Ordering::SeqCst);
///     42
/// });
///
/// for _ in 0..10 {
///     assert_eq!(cell.with(|v| *v), 42);
/// }
/// assert_eq!(calls.load(Ordering::SeqCst), 1);
/// ```
pub struct ThreadLocal<T: 'static> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: 'static> {
    key: os::Key,
    init: Init<T>,
}

// What a thread's key points at. `owner` keeps the OS key alive until the
// last thread holding a value has exited.
struct Slot<T: 'static> {
    value: RefCell<T>,
    owner: Arc<Inner<T>>,
}

/// Where the current thread is in a cell's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Nothing has been stored on this thread yet.
    Uninitialized,
    /// The initializer is running on this thread.
    Initializing,
    /// This thread has a value.
    Initialized,
    /// This thread's value has been destroyed.
    Destroyed,
}

impl<T: 'static> ThreadLocal<T> {
    /// Creates a cell whose per-thread values are produced by `init`.
    ///
    /// Nothing happens until the first access; in particular `init` isn't
    /// called here.
    ///
    /// `init` may be called from many threads at once. If it touches shared
    /// state, making that safe is up to `init`.
    pub fn new<F>(init: F) -> ThreadLocal<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        ThreadLocal::from_init(Box::new(move || -> Result<T, BoxError> {
            Ok(init())
        }))
    }

    /// Creates a cell where each thread starts with its own clone of `value`.
    ///
    /// How independent the copies are is up to `T`'s `Clone`: a `Vec` is
    /// copied, an `Arc` is shared.
    pub fn with_value(value: T) -> ThreadLocal<T>
    where
        T: Clone + Send + Sync,
    {
        ThreadLocal::new(move || value.clone())
    }

    /// Creates a cell whose initializer can fail.
    ///
    /// Errors are reported by the `try_` accessors as [`AccessError::Init`];
    /// the other accessors panic with them.
    ///
    /// # Example
    ///
    /// ```
    /// use threadly::{AccessError, State, ThreadLocal};
    ///
    /// let cell = ThreadLocal::new_fallible(|| "12".parse::<u32>());
    /// assert_eq!(cell.try_with(|v| *v).unwrap(), 12);
    ///
    /// let cell = ThreadLocal::new_fallible(|| "twelve".parse::<u32>());
    /// assert!(matches!(cell.try_with(|v| *v), Err(AccessError::Init(_))));
    /// assert_eq!(cell.state(), State::Uninitialized);
    /// ```
    pub fn new_fallible<F, E>(init: F) -> ThreadLocal<T>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        ThreadLocal::from_init(Box::new(move || -> Result<T, BoxError> {
            init().map_err(Into::into)
        }))
    }

    fn from_init(init: Init<T>) -> ThreadLocal<T> {
        ThreadLocal {
            inner: Arc::new(Inner {
                key: os::Key::new(Some(destroy_value::<T>)),
                init,
            }),
        }
    }

    /// Runs `f` with a reference to this thread's value, initializing it
    /// first if needed.
    ///
    /// # Panics
    ///
    /// Panics with the [`AccessError`] that [`try_with`](Self::try_with) would
    /// have returned.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        // `f` must still be alive when the panic starts: dropping it first
        // could run a destructor that touches this cell again.
        let slot = match self.slot() {
            Ok(slot) => slot,
            Err(err) => panic!("{}", err),
        };
        let value = match slot.value.try_borrow() {
            Ok(value) => value,
            Err(err) => panic!("{}", AccessError::from(err)),
        };
        f(&*value)
    }

    /// Runs `f` with a reference to this thread's value, initializing it
    /// first if needed.
    ///
    /// Fails if the initializer fails, if it's called from the initializer or
    /// after the value was destroyed, or while `with_mut` is running on this
    /// thread.
    pub fn try_with<F, R>(&self, f: F) -> Result<R, AccessError>
    where
        F: FnOnce(&T) -> R,
    {
        let slot = self.slot()?;
        let value = slot.value.try_borrow()?;
        Ok(f(&*value))
    }

    /// Runs `f` with a mutable reference to this thread's value, initializing
    /// it first if needed.
    ///
    /// # Panics
    ///
    /// Panics with the [`AccessError`] that
    /// [`try_with_mut`](Self::try_with_mut) would have returned.
    pub fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let slot = match self.slot() {
            Ok(slot) => slot,
            Err(err) => panic!("{}", err),
        };
        let mut value = match slot.value.try_borrow_mut() {
            Ok(value) => value,
            Err(err) => panic!("{}", AccessError::from(err)),
        };
        f(&mut *value)
    }

    /// Runs `f` with a mutable reference to this thread's value, initializing
    /// it first if needed.
    ///
    /// Fails like [`try_with`](Self::try_with), and also while any other
    /// access to this cell is running on this thread.
    pub fn try_with_mut<F, R>(&self, f: F) -> Result<R, AccessError>
    where
        F: FnOnce(&mut T) -> R,
    {
        let slot = self.slot()?;
        let mut value = slot.value.try_borrow_mut()?;
        Ok(f(&mut *value))
    }

    /// Overwrites this thread's value.
    ///
    /// If this thread never accessed the cell, the initializer still runs
    /// first and its value is dropped.
    ///
    /// # Panics
    ///
    /// Panics like [`with_mut`](Self::with_mut). The rejected `value` is
    /// dropped while that panic unwinds.
    pub fn set(&self, value: T) {
        drop(self.replace(value));
    }

    /// Replaces this thread's value, returning the old one.
    ///
    /// # Panics
    ///
    /// Panics like [`with_mut`](Self::with_mut).
    pub fn replace(&self, value: T) -> T {
        self.with_mut(|slot| mem::replace(slot, value))
    }

    /// Takes this thread's value, leaving `T::default()` behind.
    ///
    /// # Panics
    ///
    /// Panics like [`with_mut`](Self::with_mut).
    pub fn take(&self) -> T
    where
        T: Default,
    {
        self.replace(T::default())
    }

    /// Returns where the current thread is in this cell's lifecycle.
    ///
    /// Never runs the initializer.
    pub fn state(&self) -> State {
        match self.inner.key.try_get() {
            None => State::Uninitialized,
            Some(ptr) if ptr.is_null() => State::Uninitialized,
            Some(ptr) if ptr == os::BUSY => State::Initializing,
            Some(ptr) if ptr == os::DESTROYED => State::Destroyed,
            Some(_) => State::Initialized,
        }
    }

    fn slot(&self) -> Result<&Slot<T>, AccessError> {
        let ptr = self.inner.key.get()?;
        let slot = if ptr.is_null() {
            self.initialize()?
        } else if ptr == os::BUSY {
            return Err(AccessError::Reentrant);
        } else if ptr == os::DESTROYED {
            return Err(AccessError::Destroyed);
        } else {
            ptr as *const Slot<T>
        };

        // The slot is only freed when this thread exits, which can't happen
        // while it's borrowed here.
        Ok(unsafe { &*slot })
    }

    #[cold]
    fn initialize(&self) -> Result<*const Slot<T>, AccessError> {
        let key = &self.inner.key;
        unsafe { key.set(os::BUSY)? };
        let reset = Reset(key);

        let value = (self.inner.init)().map_err(|err| {
            tracing::debug!(error = %err, "thread-local initializer failed");
            AccessError::Init(err)
        })?;

        let slot = Box::into_raw(Box::new(Slot {
            value: RefCell::new(value),
            owner: Arc::clone(&self.inner),
        }));
        if let Err(err) = unsafe { key.set(slot as *mut u8) } {
            drop(unsafe { Box::from_raw(slot) });
            return Err(err.into());
        }

        mem::forget(reset);
        Ok(slot)
    }
}

// Puts the slot back to uninitialized if the initializer fails or unwinds.
struct Reset<'a>(&'a os::Key);

impl Drop for Reset<'_> {
    fn drop(&mut self) {
        let _ = unsafe { self.0.set(ptr::null_mut()) };
    }
}

unsafe extern "C" fn destroy_value<T: 'static>(ptr: *mut u8) {
    if os::is_marker(ptr) {
        return;
    }

    let slot = Box::from_raw(ptr as *mut Slot<T>);
    // Mark the slot first so that nothing run from `T::drop` can bring the
    // value back. The value drops before `owner`, which may delete the key.
    let _ = slot.owner.key.set(os::DESTROYED);
    drop(slot);
}

impl<T: 'static> Clone for ThreadLocal<T> {
    /// Returns another handle to the same cell; no value is cloned.
    fn clone(&self) -> ThreadLocal<T> {
        ThreadLocal {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default + 'static> Default for ThreadLocal<T> {
    fn default() -> ThreadLocal<T> {
        ThreadLocal::new(T::default)
    }
}

impl<T: 'static> fmt::Debug for ThreadLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocal")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
