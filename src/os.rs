//! OS-based thread local storage
//!
//! This module wraps the platform's thread-local storage keys (think
//! `pthread_key_create`/`pthread_setspecific`, or the portable key table in
//! `fallback.rs`) in a single `Key` type. An OS key can only get and set a
//! pointer per thread; everything typed is built on top of it in `local.rs`.
//!
//! Native keys are a limited resource (`PTHREAD_KEYS_MAX`, 1024 on glibc).
//! Once the platform refuses to hand out more, new keys come from the portable
//! table instead; those carry the `PORTABLE` bit so every later call is routed
//! back to the table.
//!
//! The key itself is allocated lazily on first use and deallocated when the
//! `Key` is dropped. A destructor given to `Key::new` is invoked at thread exit
//! for every thread whose pointer for this key is non-null.
//!
//! Besides null ("nothing stored yet") two pointer values are reserved as slot
//! markers, `BUSY` and `DESTROYED`. They are never dereferenced, and a
//! destructor must ignore them (see `is_marker`).

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use self::sys::RawKey;

/// Destructor invoked with a thread's pointer when that thread exits.
pub type Dtor = unsafe extern "C" fn(*mut u8);

/// The slot's value is being produced on this thread right now.
pub const BUSY: *mut u8 = 1 as *mut u8;

/// The slot's value has been (or is being) destroyed on this thread.
pub const DESTROYED: *mut u8 = 2 as *mut u8;

/// Returns whether `ptr` is null or one of the slot markers rather than a
/// pointer to a stored value.
pub fn is_marker(ptr: *mut u8) -> bool {
    ptr.is_null() || ptr == BUSY || ptr == DESTROYED
}

/// A lazily allocated, owned OS TLS key.
///
/// `0` is used as the "not yet allocated" sentinel for the inner atomic, so a
/// key of value `0` handed out by the platform is never kept.
///
/// # Example
///
/// ```ignore
/// let key = Key::new(None);
/// assert!(key.get().unwrap().is_null());
/// unsafe { key.set(BUSY).unwrap() };
/// assert_eq!(key.get().unwrap(), BUSY);
/// ```
pub struct Key {
    key: AtomicUsize,
    dtor: Option<Dtor>,
}

impl Key {
    /// Creates a new key. Nothing is allocated until the first `get` or `set`.
    pub const fn new(dtor: Option<Dtor>) -> Key {
        Key {
            key: AtomicUsize::new(0),
            dtor,
        }
    }

    /// Gets this thread's pointer for this key, allocating the OS key if it
    /// has not been allocated yet.
    pub fn get(&self) -> io::Result<*mut u8> {
        let key = self.key()?;
        Ok(unsafe { sys::get(key) })
    }

    /// Gets this thread's pointer, or `None` if the OS key was never
    /// allocated (in which case no thread has stored anything).
    pub fn try_get(&self) -> Option<*mut u8> {
        match self.key.load(Ordering::Acquire) {
            0 => None,
            n => Some(unsafe { sys::get(n) }),
        }
    }

    /// Sets this thread's pointer for this key.
    ///
    /// # Safety
    ///
    /// Unless `val` is null or a marker, the destructor passed to `new` will
    /// be called with it when this thread exits, so it must be valid for that.
    pub unsafe fn set(&self, val: *mut u8) -> io::Result<()> {
        let key = self.key()?;
        sys::set(key, val)
    }

    fn key(&self) -> io::Result<RawKey> {
        match self.key.load(Ordering::Acquire) {
            0 => self.lazy_init(),
            n => Ok(n),
        }
    }

    #[cold]
    fn lazy_init(&self) -> io::Result<usize> {
        let key = unsafe { self.create()? };
        match self
            .key
            .compare_exchange(0, key, Ordering::AcqRel, Ordering::Acquire)
        {
            // The CAS succeeded, so we own the key now
            Ok(_) => {
                tracing::trace!(key, "allocated thread-local key");
                Ok(key)
            }
            // If someone beat us to the punch, use their key instead
            Err(n) => {
                unsafe { sys::destroy(key) };
                Ok(n)
            }
        }
    }

    unsafe fn create(&self) -> io::Result<usize> {
        let key = sys::create(self.dtor)?;
        if key != 0 {
            return Ok(key);
        }

        // 0 can't be told apart from "unallocated", so grab a second key and
        // give 0 back.
        let second = sys::create(self.dtor);
        sys::destroy(key);
        let second = second?;
        tracing::trace!(key = second, "platform returned key 0, reallocated");
        debug_assert!(second != 0);
        Ok(second)
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        match *self.key.get_mut() {
            0 => {}
            n => {
                unsafe { sys::destroy(n) };
                tracing::trace!(key = n, "deleted thread-local key");
            }
        }
    }
}

#[cfg(all(unix, not(feature = "fallback")))]
mod sys {
    use std::io;

    use super::Dtor;
    use crate::{fallback, unix};

    pub type RawKey = usize;

    /// Set on keys handed out by the portable table.
    pub const PORTABLE: RawKey = 1 << (RawKey::BITS - 1);

    pub unsafe fn create(dtor: Option<Dtor>) -> io::Result<RawKey> {
        match unix::create(dtor) {
            Ok(key) => Ok(key as RawKey),
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                let key = fallback::create(dtor)? | PORTABLE;
                tracing::debug!(key, "out of native thread-local keys, using the portable table");
                Ok(key)
            }
            Err(err) => Err(err),
        }
    }

    pub unsafe fn set(key: RawKey, value: *mut u8) -> io::Result<()> {
        match key & PORTABLE {
            0 => unix::set(key as unix::Key, value),
            _ => fallback::set(key & !PORTABLE, value),
        }
    }

    pub unsafe fn get(key: RawKey) -> *mut u8 {
        match key & PORTABLE {
            0 => unix::get(key as unix::Key),
            _ => fallback::get(key & !PORTABLE),
        }
    }

    pub unsafe fn destroy(key: RawKey) {
        match key & PORTABLE {
            0 => unix::destroy(key as unix::Key),
            _ => fallback::destroy(key & !PORTABLE),
        }
    }
}

#[cfg(any(not(unix), feature = "fallback"))]
mod sys {
    pub use crate::fallback::{create, destroy, get, set, Key as RawKey};
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{channel, Sender};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use super::{is_marker, sys, Key, BUSY, DESTROYED};

    fn assert_sync<T: Sync>() {}
    fn assert_send<T: Send>() {}

    #[test]
    fn smoke() {
        assert_sync::<Key>();
        assert_send::<Key>();

        let k1 = Key::new(None);
        let k2 = Key::new(None);
        assert!(k1.try_get().is_none());
        assert!(k1.get().unwrap().is_null());
        assert!(k2.get().unwrap().is_null());
        unsafe {
            k1.set(1 as *mut _).unwrap();
            k2.set(2 as *mut _).unwrap();
        }
        assert_eq!(k1.get().unwrap() as usize, 1);
        assert_eq!(k2.get().unwrap() as usize, 2);
        assert_eq!(k1.try_get(), Some(1 as *mut u8));
    }

    #[test]
    fn statik() {
        static K1: Key = Key::new(None);
        static K2: Key = Key::new(None);

        unsafe {
            assert!(K1.get().unwrap().is_null());
            assert!(K2.get().unwrap().is_null());
            K1.set(1 as *mut _).unwrap();
            K2.set(2 as *mut _).unwrap();
            assert_eq!(K1.get().unwrap() as usize, 1);
            assert_eq!(K2.get().unwrap() as usize, 2);
        }
    }

    #[test]
    fn per_thread() {
        static K: Key = Key::new(None);

        unsafe { K.set(1 as *mut _).unwrap() };
        thread::spawn(|| {
            assert!(K.get().unwrap().is_null());
            unsafe { K.set(2 as *mut _).unwrap() };
        })
        .join()
        .unwrap();
        assert_eq!(K.get().unwrap() as usize, 1);
    }

    #[test]
    fn markers() {
        assert!(is_marker(std::ptr::null_mut()));
        assert!(is_marker(BUSY));
        assert!(is_marker(DESTROYED));
        let mut x = 0u8;
        assert!(!is_marker(&mut x));
    }

    #[test]
    fn dtor_runs_at_thread_exit() {
        static TX: Mutex<Option<Sender<usize>>> = Mutex::new(None);
        static K: Key = Key::new(Some(dtor));

        unsafe extern "C" fn dtor(ptr: *mut u8) {
            let value = Box::from_raw(ptr as *mut usize);
            if let Some(tx) = TX.lock().unwrap().as_ref() {
                tx.send(*value).unwrap();
            }
        }

        let (tx, rx) = channel();
        *TX.lock().unwrap() = Some(tx);

        thread::spawn(|| unsafe {
            K.set(Box::into_raw(Box::new(7usize)) as *mut u8).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 7);
    }

    #[cfg(all(unix, not(feature = "fallback")))]
    #[test]
    fn portable_keys_use_the_table() {
        use crate::fallback;

        unsafe {
            let raw = fallback::create(None).unwrap();
            let key = raw | sys::PORTABLE;
            sys::set(key, 9 as *mut u8).unwrap();
            assert_eq!(sys::get(key) as usize, 9);
            assert_eq!(fallback::get(raw) as usize, 9);
            sys::set(key, std::ptr::null_mut()).unwrap();
            assert!(fallback::get(raw).is_null());
            sys::destroy(key);
        }
    }

    /// Collects the messages of every event recorded on this thread.
    struct Messages(std::sync::Arc<Mutex<Vec<String>>>);

    impl tracing::Subscriber for Messages {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }

        fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}

        fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}

        fn event(&self, event: &tracing::Event<'_>) {
            struct Message<'a>(&'a mut String);

            impl tracing::field::Visit for Message<'_> {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "message" {
                        *self.0 = format!("{:?}", value);
                    }
                }
            }

            let mut message = String::new();
            event.record(&mut Message(&mut message));
            self.0.lock().unwrap().push(message);
        }

        fn enter(&self, _: &tracing::span::Id) {}

        fn exit(&self, _: &tracing::span::Id) {}
    }

    #[test]
    fn key_lifetime_is_traced() {
        let messages = std::sync::Arc::new(Mutex::new(Vec::new()));
        tracing::subscriber::with_default(Messages(messages.clone()), || {
            let key = Key::new(None);
            assert!(key.get().unwrap().is_null());
            drop(key);
        });

        let messages = messages.lock().unwrap();
        assert!(messages.iter().any(|m| m == "allocated thread-local key"));
        assert_eq!(messages.last().map(|m| &m[..]), Some("deleted thread-local key"));
    }
}
