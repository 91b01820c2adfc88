use std::cell::{BorrowError, BorrowMutError};
use std::error::Error;
use std::io;

/// Boxed error returned by a fallible initializer.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An error returned by the `try_` accessors of [`ThreadLocal`].
///
/// The panicking accessors panic with this error's message instead.
///
/// [`ThreadLocal`]: crate::ThreadLocal
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AccessError {
    /// The initializer failed. Nothing was stored, so the next access on this
    /// thread runs the initializer again.
    #[error("thread-local initializer failed: {0}")]
    Init(BoxError),

    /// The initializer tried to access the value it is initializing.
    #[error("thread-local value accessed from its own initializer")]
    Reentrant,

    /// This thread's value has already been destroyed, or is being destroyed.
    #[error("cannot access a thread-local value after it has been destroyed")]
    Destroyed,

    /// The platform could not provide a thread-local key.
    #[error("failed to allocate thread-local storage")]
    Key(#[from] io::Error),

    /// The value is currently mutably borrowed on this thread.
    #[error(transparent)]
    Borrow(#[from] BorrowError),

    /// The value is currently borrowed on this thread.
    #[error(transparent)]
    BorrowMut(#[from] BorrowMutError),
}
