//! Lazily initialized thread-local cells.
//!
//! [`ThreadLocal`] keeps one value per thread. Each thread's value is created
//! by the cell's initializer on that thread's first access and dropped when
//! the thread exits. Values are backed by native OS keys (`pthread` keys on
//! unix) or, elsewhere, by a portable key table; the `fallback` feature forces
//! the portable table everywhere. On unix the portable table also takes over
//! once the process runs out of `pthread` keys, so the number of live cells
//! is not capped by `PTHREAD_KEYS_MAX`.

pub use crate::error::{AccessError, BoxError};
pub use crate::local::{State, ThreadLocal};

#[cfg(all(unix, not(feature = "fallback")))]
mod unix;

mod error;
mod fallback;
mod local;
mod os;
