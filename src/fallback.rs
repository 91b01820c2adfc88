//! Portable thread-local keys
//!
//! Used where native keys with destructors aren't available, when the
//! `fallback` feature asks for it, and on unix once the native keys run out. Each thread owns a table from key to
//! pointer, kept in a std thread-local whose `Drop` is the thread-exit hook
//! that runs the key destructors. Destructors live in one global registry;
//! its lock is only taken to create or delete a key and to look a destructor
//! up while a thread exits, never on `get` or `set`.
//!
//! Once a thread's table has been torn down, `get` reports `DESTROYED` for
//! every key and `set` fails.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{const_mutex, Mutex};

use crate::os::{Dtor, DESTROYED};

pub type Key = usize;

static NEXT_KEY: AtomicUsize = AtomicUsize::new(1);
static DTORS: Mutex<BTreeMap<Key, Dtor>> = const_mutex(BTreeMap::new());

struct Table {
    values: RefCell<BTreeMap<Key, *mut u8>>,
}

thread_local! {
    static TABLE: Table = const {
        Table { values: RefCell::new(BTreeMap::new()) }
    };
}

pub unsafe fn create(dtor: Option<Dtor>) -> io::Result<Key> {
    // Keys are never reused, so a stale entry left in some thread's table by
    // a deleted key can't be mistaken for a live one.
    let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
    if let Some(dtor) = dtor {
        DTORS.lock().insert(key, dtor);
    }
    Ok(key)
}

pub unsafe fn set(key: Key, value: *mut u8) -> io::Result<()> {
    TABLE
        .try_with(|table| {
            let mut values = table.values.borrow_mut();
            if value.is_null() {
                values.remove(&key);
            } else {
                values.insert(key, value);
            }
        })
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "thread-local table already destroyed"))
}

pub unsafe fn get(key: Key) -> *mut u8 {
    TABLE
        .try_with(|table| {
            table
                .values
                .borrow()
                .get(&key)
                .copied()
                .unwrap_or(ptr::null_mut())
        })
        .unwrap_or(DESTROYED)
}

pub unsafe fn destroy(key: Key) {
    DTORS.lock().remove(&key);
}

impl Drop for Table {
    fn drop(&mut self) {
        // `TABLE` already counts as destroyed while this runs, so destructors
        // can't store new values behind our back.
        for (key, value) in mem::take(self.values.get_mut()) {
            let dtor = DTORS.lock().get(&key).copied();
            if let Some(dtor) = dtor {
                unsafe { dtor(value) }
            }
        }
    }
}
