//! The "real" versions of the libc functions we intercept.
//!
//! Each pointer is resolved with `dlsym(RTLD_NEXT, ...)`, i.e. the next
//! definition after this library in the dynamic linker's search order.

use std::ffi::{c_char, c_int, c_void, CStr};

use once_cell::sync::Lazy;

type OpenFn = unsafe extern "C" fn(*const c_char, c_int, libc::mode_t) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, usize) -> isize;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, usize) -> isize;

struct Real {
    open: OpenFn,
    close: CloseFn,
    read: ReadFn,
    write: WriteFn,
}

// Written once on first use, strictly before any interception decision that
// needs it, then read-only. Failing to resolve a name is fatal: the panic
// hits an extern "C" boundary and aborts the process.
static REAL: Lazy<Real> = Lazy::new(|| unsafe {
    Real {
        open: resolve(CStr::from_bytes_with_nul(b"open\0").unwrap()),
        close: resolve(CStr::from_bytes_with_nul(b"close\0").unwrap()),
        read: resolve(CStr::from_bytes_with_nul(b"read\0").unwrap()),
        write: resolve(CStr::from_bytes_with_nul(b"write\0").unwrap()),
    }
});

/// # Safety
///
/// `F` must be a function-pointer type matching the symbol's actual
/// signature.
unsafe fn resolve<F>(name: &CStr) -> F {
    debug_assert_eq!(
        std::mem::size_of::<F>(),
        std::mem::size_of::<*mut c_void>()
    );
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    assert!(!sym.is_null(), "dlsym(RTLD_NEXT, {name:?}) failed");
    // SAFETY: non-null symbol addresses from the dynamic linker are valid
    // function pointers; the caller vouches for the signature.
    unsafe { std::mem::transmute_copy(&sym) }
}

/// # Safety
///
/// Same contract as `open(2)`.
pub unsafe fn open(path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    unsafe { (REAL.open)(path, flags, mode) }
}

/// # Safety
///
/// Same contract as `close(2)`.
pub unsafe fn close(fd: c_int) -> c_int {
    unsafe { (REAL.close)(fd) }
}

/// # Safety
///
/// Same contract as `read(2)`.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: usize) -> isize {
    unsafe { (REAL.read)(fd, buf, count) }
}

/// # Safety
///
/// Same contract as `write(2)`.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: usize) -> isize {
    unsafe { (REAL.write)(fd, buf, count) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_and_passes_through() {
        let path = CStr::from_bytes_with_nul(b"/dev/null\0").unwrap();
        let fd = unsafe { open(path.as_ptr(), libc::O_RDONLY, 0) };
        assert!(fd >= 0);

        let mut buf = [0u8; 8];
        let n = unsafe { read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 0);

        assert_eq!(unsafe { close(fd) }, 0);
    }
}
