//! # sandstorm-vfs-shim
//!
//! `LD_PRELOAD` interposition layer that redirects file I/O under the
//! `/sandstorm-magic` prefix to a remote filesystem service spoken to over
//! Cap'n Proto RPC. The surrounding process is unaware: descriptors that
//! don't name the magic prefix pass straight through to the host libc.
//!
//! ## Usage
//!
//! ```bash
//! SANDSTORM_VFS_SERVER=unix:/run/vfs.sock \
//! LD_PRELOAD=/path/to/libsandstorm_vfs_shim.so \
//! some-program
//! ```
//!
//! ## Environment variables
//!
//! - `SANDSTORM_VFS_SERVER`: service endpoint, `unix:/path` or `host:port`
//!   (required; checked when the first virtual path is opened)
//! - `SANDSTORM_VFS_LOG`: log filter in `env_logger` syntax (optional)
//!
//! Only `open`, `close`, `read`, and `write` are interposed. A descriptor
//! returned for a virtual path is a real kernel descriptor (so it can never
//! collide with ones the kernel hands out), but its `read`/`write`/`close`
//! are serviced from the descriptor table rather than the kernel.

#![deny(unsafe_op_in_unsafe_fn)]

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::Arc;

use nix::errno::Errno;
use once_cell::sync::Lazy;

pub mod filesystem_capnp {
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/filesystem_capnp.rs"));
}

mod connection;
mod file;
mod injector;
mod loop_bound;
mod oflags;
mod open;
mod pathname;
mod real;
mod vfs;

/// Lazily wires the log facade to stderr. Filtered by `SANDSTORM_VFS_LOG`
/// rather than `RUST_LOG`: the host process's own log configuration must
/// not leak into the shim.
static LOGGING: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter("SANDSTORM_VFS_LOG"))
        .format_timestamp(None)
        .try_init();
});

fn set_errno(errno: Errno) {
    // SAFETY: __errno_location points at this thread's errno slot.
    unsafe { *libc::__errno_location() = errno as c_int };
}

/// # Safety
///
/// `path` must be a valid C string.
unsafe fn open_inner(path: *const c_char, flags: c_int, mode: libc::mode_t) -> Result<c_int, Errno> {
    Lazy::force(&LOGGING);

    // SAFETY: caller contract.
    let cpath = unsafe { CStr::from_ptr(path) };
    let passthrough = || {
        // The original sets errno itself; we must not touch it afterwards.
        Ok(unsafe { real::open(path, flags, mode) })
    };

    // Magic paths are plain ASCII; anything unrepresentable is not ours.
    let Ok(utf8) = cpath.to_str() else {
        return passthrough();
    };

    let segments = pathname::eval(utf8, &pathname::current_dir_segments());
    let segments = if pathname::is_magic(&segments) {
        segments
    } else {
        // One symlink hop: a real link whose target names the virtual tree
        // also routes to the service.
        match pathname::symlink_target(cpath, &segments) {
            Some(target) if pathname::is_magic(&target) => target,
            _ => return passthrough(),
        }
    };

    log::debug!("open({utf8:?}) routed to the virtual tree as {segments:?}");
    let file = open::open_virtual(&segments, flags, mode)?;
    let vfs = vfs::global();
    let fd = vfs.alloc_fd();
    vfs.add_file(fd, Arc::new(file));
    Ok(fd)
}

/// The `LD_PRELOAD` entry points. Each thunk decodes arguments, delegates to
/// an inner function returning `Result`, and converts failures to the
/// `-1`-plus-errno convention. Panics never unwind past these boundaries:
/// unwinding out of an `extern "C"` function aborts the process, which is
/// the intended behavior for every fatal condition in the shim.
pub mod export {
    use super::*;

    /// Interposed `open(2)`.
    ///
    /// Declared with a third `mode_t` parameter rather than `...`: on this
    /// platform's calling convention that is ABI-compatible with the
    /// variadic C prototype, and the argument is only read when `flags`
    /// says the caller passed one.
    ///
    /// # Safety
    ///
    /// Same contract as `open(2)`.
    #[no_mangle]
    pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
        let mode = if oflags::has_mode_arg(flags) { mode } else { 0 };
        // SAFETY: caller contract.
        match unsafe { open_inner(path, flags, mode) } {
            Ok(fd) => fd,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    }

    /// Interposed `close(2)`. Virtual and kernel descriptors take the same
    /// path; non-virtual ones are merely absent from the table.
    #[no_mangle]
    pub extern "C" fn close(fd: c_int) -> c_int {
        vfs::global().close_fd(fd)
    }

    /// Interposed `read(2)`.
    ///
    /// # Safety
    ///
    /// Same contract as `read(2)`: `buf` must be writable for `count` bytes.
    #[no_mangle]
    pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: usize) -> isize {
        let Some(file) = vfs::global().file(fd) else {
            // SAFETY: caller contract.
            return unsafe { real::read(fd, buf, count) };
        };
        let mut empty = [0u8; 0];
        let buf = if count == 0 {
            &mut empty[..]
        } else {
            // SAFETY: caller contract.
            unsafe { std::slice::from_raw_parts_mut(buf as *mut u8, count) }
        };
        match file.read(buf) {
            Ok(n) => n as isize,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    }

    /// Interposed `write(2)`.
    ///
    /// # Safety
    ///
    /// Same contract as `write(2)`: `buf` must be readable for `count` bytes.
    #[no_mangle]
    pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: usize) -> isize {
        let Some(file) = vfs::global().file(fd) else {
            // SAFETY: caller contract.
            return unsafe { real::write(fd, buf, count) };
        };
        let empty = [0u8; 0];
        let buf = if count == 0 {
            &empty[..]
        } else {
            // SAFETY: caller contract.
            unsafe { std::slice::from_raw_parts(buf as *const u8, count) }
        };
        match file.write(buf) {
            Ok(n) => n as isize,
            Err(e) => {
                set_errno(e);
                -1
            }
        }
    }
}
