#![allow(non_camel_case_types)]

use std::io;
use std::mem;

use libc::c_void;

use crate::os::Dtor;

pub type Key = libc::pthread_key_t;

type pthread_dtor_t = unsafe extern "C" fn(*mut c_void);

pub unsafe fn create(dtor: Option<Dtor>) -> io::Result<Key> {
    let mut key = 0;
    // `*mut u8` and `*mut c_void` share an ABI
    let dtor = mem::transmute::<Option<Dtor>, Option<pthread_dtor_t>>(dtor);
    match libc::pthread_key_create(&mut key, dtor) {
        0 => Ok(key),
        err => Err(io::Error::from_raw_os_error(err)),
    }
}

pub unsafe fn set(key: Key, value: *mut u8) -> io::Result<()> {
    match libc::pthread_setspecific(key, value as *const c_void) {
        0 => Ok(()),
        err => Err(io::Error::from_raw_os_error(err)),
    }
}

pub unsafe fn get(key: Key) -> *mut u8 {
    libc::pthread_getspecific(key) as *mut u8
}

pub unsafe fn destroy(key: Key) {
    let r = libc::pthread_key_delete(key);
    debug_assert_eq!(r, 0);
}
