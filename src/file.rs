//! Virtual file objects backing intercepted descriptors.

use std::ffi::c_int;
use std::sync::atomic::{AtomicU64, Ordering};

use capnp::capability::FromClientHook;
use nix::errno::Errno;

use crate::filesystem_capnp::{node, rw_file, stat_info};
use crate::loop_bound::LoopBound;
use crate::oflags;

/// What a node is, per the service's stat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

/// Metadata cached at open time. The service is the source of truth; we do
/// not observe changes it makes after the open.
#[derive(Clone, Copy, Debug)]
pub struct NodeMeta {
    pub writable: bool,
    pub executable: bool,
    pub kind: NodeKind,
}

impl NodeMeta {
    pub(crate) fn from_stat(info: stat_info::Reader<'_>) -> Result<NodeMeta, capnp::Error> {
        let kind = match info.get_kind()? {
            stat_info::Kind::File => NodeKind::File,
            stat_info::Kind::Dir => NodeKind::Dir,
            stat_info::Kind::Symlink => NodeKind::Symlink,
        };
        Ok(NodeMeta {
            writable: info.get_writable(),
            executable: info.get_executable(),
            kind,
        })
    }

    /// Metadata for a node we just created with `mode`; the service is not
    /// re-stat'ed.
    pub(crate) fn from_create_mode(mode: libc::mode_t) -> NodeMeta {
        NodeMeta {
            writable: mode & oflags::MODE_WRITABLE != 0,
            executable: mode & oflags::MODE_EXECUTABLE != 0,
            kind: NodeKind::File,
        }
    }
}

/// A file-like object behind a virtual descriptor.
///
/// Concurrent calls on the *same* descriptor are a caller bug (the usual
/// POSIX contract for sharing an open file without coordination); distinct
/// descriptors may be used freely from distinct threads.
pub trait PseudoFile: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&self, buf: &[u8]) -> Result<usize, Errno>;
}

/// A virtual file backed by a node capability on the remote service.
pub struct CapnpFile {
    node: LoopBound<node::Client>,
    oflags: c_int,
    /// Byte position of the next write. Advanced only by a successful write.
    offset: AtomicU64,
    meta: NodeMeta,
}

impl CapnpFile {
    pub(crate) fn new(node: LoopBound<node::Client>, oflags: c_int, meta: NodeMeta) -> CapnpFile {
        CapnpFile {
            node,
            oflags,
            offset: AtomicU64::new(0),
            meta,
        }
    }
}

impl PseudoFile for CapnpFile {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, Errno> {
        // There is no read path from the service.
        Err(Errno::ENOSYS)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        if oflags::access_mode(self.oflags) == libc::O_RDONLY || !self.meta.writable {
            return Err(Errno::EPERM);
        }
        if self.meta.kind == NodeKind::Dir {
            // What write(2) reports for a descriptor opened on a directory.
            return Err(Errno::EBADF);
        }

        let start_at = self.offset.load(Ordering::Relaxed);
        crate::vfs::global().injector().run_in_loop(|_state| {
            let node = self.node.get().clone();
            Box::pin(async move {
                let file: rw_file::Client = node.cast_to();

                // The whole chain is launched as one batch: the sink is
                // pipelined out of the write request, and the three sink
                // calls are all in flight before anything is awaited.
                let mut write_req = file.write_request();
                write_req.get().set_start_at(start_at);
                let sink = write_req.send().pipeline.get_sink();

                let mut expect_req = sink.expect_size_request();
                expect_req.get().set_size(buf.len() as u64);
                let expect_sent = expect_req.send().promise;

                let mut chunk_req = sink.write_request();
                chunk_req.get().set_data(buf);
                let chunk_sent = chunk_req.send().promise;

                let done_sent = sink.done_request().send().promise;

                futures::future::try_join3(expect_sent, chunk_sent, done_sent)
                    .await
                    .map_err(|e| {
                        log::error!("remote write failed: {e}");
                        Errno::EIO
                    })?;
                Ok(())
            })
        })?;

        // No partial writes: the service either consumed the whole chunk or
        // the call failed above with nothing advanced.
        self.offset.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }
}
