//! Translating an intercepted `open` into capability operations on the
//! remote tree.

use std::ffi::c_int;

use capnp::capability::FromClientHook;
use nix::errno::Errno;

use crate::connection::LoopState;
use crate::file::{CapnpFile, NodeMeta};
use crate::filesystem_capnp::{node, rw_directory};
use crate::loop_bound::LoopBound;

/// Where a path walk ended up: the node the path names, the directory that
/// would be asked to create it, and the final segment (absent only when the
/// path names the root itself).
struct WalkedPath {
    parent: rw_directory::Client,
    node: node::Client,
    basename: Option<String>,
}

/// Walk `segments` (the leading one being the magic prefix) from the root.
/// Every walk request is pipelined; nothing is awaited here, so failures
/// surface at whatever stats or creates the caller issues next.
fn walk(root: &rw_directory::Client, segments: &[String]) -> WalkedPath {
    let mut parent = root.clone();
    let mut node: node::Client = root.clone().cast_to();
    let mut basename = None;

    for seg in &segments[1..] {
        let dir: rw_directory::Client = node.cast_to();
        let mut req = dir.walk_request();
        req.get().set_name(seg.as_str());
        node = req.send().pipeline.get_node();
        parent = dir;
        basename = Some(seg.clone());
    }

    WalkedPath {
        parent,
        node,
        basename,
    }
}

/// The open/create decision tree, run as a single job on the loop thread.
async fn open_on_loop(
    state: LoopState,
    segments: &[String],
    flags: c_int,
    mode: libc::mode_t,
) -> Result<CapnpFile, Errno> {
    let WalkedPath {
        parent,
        node,
        basename,
    } = walk(state.root(), segments);

    match node.stat_request().send().promise.await {
        Ok(resp) => {
            let meta = resp
                .get()
                .and_then(|r| r.get_info())
                .and_then(NodeMeta::from_stat)
                .map_err(|e| {
                    log::error!("malformed stat response: {e}");
                    Errno::EIO
                })?;
            if crate::oflags::access_mode(flags) != libc::O_RDONLY && !meta.writable {
                return Err(Errno::EPERM);
            }
            Ok(CapnpFile::new(LoopBound::new(node), flags, meta))
        }
        Err(e) => {
            // The node may simply not exist; walk failures also surface
            // here rather than during the walk itself.
            log::debug!("stat failed ({e}); considering create");
            if flags & libc::O_CREAT == 0 {
                return Err(Errno::ENOENT);
            }
            let Some(name) = basename else {
                // An attempt to open() the root itself, which failed to
                // stat; there is nothing we could create.
                return Err(Errno::EPERM);
            };

            let mut req = parent.create_request();
            req.get().set_name(name.as_str());
            req.get()
                .set_executable(mode & crate::oflags::MODE_EXECUTABLE != 0);
            match req.send().promise.await {
                Ok(resp) => {
                    let node = resp
                        .get()
                        .and_then(|r| r.get_file())
                        .map_err(|_| Errno::EPERM)?;
                    Ok(CapnpFile::new(
                        LoopBound::new(node),
                        flags,
                        NodeMeta::from_create_mode(mode),
                    ))
                }
                Err(e) => {
                    log::debug!("create failed: {e}");
                    Err(Errno::EPERM)
                }
            }
        }
    }
}

/// Open a path in the virtual tree, returning the virtual file to register.
/// Enters the loop thread exactly once.
pub(crate) fn open_virtual(
    segments: &[String],
    flags: c_int,
    mode: libc::mode_t,
) -> Result<CapnpFile, Errno> {
    let mut opened: Option<CapnpFile> = None;
    let result = crate::vfs::global().injector().run_in_loop(|state| {
        let opened = &mut opened;
        Box::pin(async move {
            *opened = Some(open_on_loop(state, segments, flags, mode).await?);
            Ok(())
        })
    });
    result.map(|()| opened.expect("open job succeeded without producing a file"))
}
