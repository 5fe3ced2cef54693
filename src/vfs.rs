//! The process-wide table of virtual descriptors.

use std::collections::HashMap;
use std::ffi::c_int;
use std::os::fd::IntoRawFd;
use std::sync::{Arc, Mutex};

use once_cell::sync::{Lazy, OnceCell};
use rustix::pipe::PipeFlags;

use crate::file::PseudoFile;
use crate::injector::EventInjector;
use crate::real;

static VFS: Lazy<Vfs> = Lazy::new(Vfs::new);

pub fn global() -> &'static Vfs {
    &VFS
}

pub struct Vfs {
    /// fd -> virtual file. The lock guards map mutations only; it is never
    /// held across a syscall or an RPC.
    fd_table: Mutex<HashMap<c_int, Arc<dyn PseudoFile>>>,
    /// Spawned (together with its loop thread) on the first virtual open,
    /// not at library load: most processes under the preload never touch
    /// the virtual tree.
    injector: OnceCell<EventInjector>,
}

impl Vfs {
    fn new() -> Vfs {
        Vfs {
            fd_table: Mutex::new(HashMap::new()),
            injector: OnceCell::new(),
        }
    }

    pub fn injector(&self) -> &EventInjector {
        self.injector.get_or_init(EventInjector::new)
    }

    pub(crate) fn injector_if_spawned(&self) -> Option<&EventInjector> {
        self.injector.get()
    }

    /// The virtual file registered at `fd`, if any.
    pub fn file(&self, fd: c_int) -> Option<Arc<dyn PseudoFile>> {
        self.fd_table.lock().unwrap().get(&fd).cloned()
    }

    /// Register `file` at `fd`, replacing any existing entry.
    pub fn add_file(&self, fd: c_int, file: Arc<dyn PseudoFile>) {
        self.fd_table.lock().unwrap().insert(fd, file);
    }

    /// Close `fd`, virtual or not: the table entry (if any) is removed and
    /// dropped first, then the kernel descriptor is released. Non-virtual
    /// descriptors are simply absent from the table, so this is the close
    /// path for everything.
    pub fn close_fd(&self, fd: c_int) -> c_int {
        let file = self.fd_table.lock().unwrap().remove(&fd);
        // Dropping the last handle on a capnp-backed file releases its
        // capability via the loop thread; keep that outside the lock.
        drop(file);
        // SAFETY: plain close(2) on an integer descriptor.
        unsafe { real::close(fd) }
    }

    /// Allocate an integer handle for a virtual file. The handle is the read
    /// end of an otherwise-unused pipe: a real kernel descriptor, so the
    /// kernel cannot hand out the same integer again while it stays open,
    /// and content-blind syscalls on it (notably `close`) succeed. Costs one
    /// kernel descriptor per virtual file.
    pub fn alloc_fd(&self) -> c_int {
        let (read_end, write_end) =
            rustix::pipe::pipe_with(PipeFlags::CLOEXEC).expect("allocating a descriptor pipe");
        drop(write_end);
        read_end.into_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    struct StubFile;

    impl PseudoFile for StubFile {
        fn read(&self, _buf: &mut [u8]) -> Result<usize, Errno> {
            Err(Errno::ENOSYS)
        }

        fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
            Ok(buf.len())
        }
    }

    #[test]
    fn test_alloc_fd_is_a_real_descriptor() {
        let vfs = Vfs::new();
        let fd = vfs.alloc_fd();
        assert!(fd >= 0);
        // A live kernel descriptor answers fcntl.
        assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);
        assert_eq!(unsafe { real::close(fd) }, 0);
    }

    #[test]
    fn test_table_insert_lookup_close() {
        let vfs = Vfs::new();
        let fd = vfs.alloc_fd();

        assert!(vfs.file(fd).is_none());
        vfs.add_file(fd, Arc::new(StubFile));
        let file = vfs.file(fd).expect("registered file");
        assert_eq!(file.write(b"xy"), Ok(2));

        // close releases both the entry and the kernel descriptor.
        assert_eq!(vfs.close_fd(fd), 0);
        assert!(vfs.file(fd).is_none());
    }

    #[test]
    fn test_close_fd_passes_through_for_unknown_fds() {
        let vfs = Vfs::new();
        let fd = vfs.alloc_fd();
        // Not registered in the table; close_fd is still the uniform path.
        assert_eq!(vfs.close_fd(fd), 0);
    }
}
