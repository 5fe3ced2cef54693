//! The RPC connection to the filesystem service.
//!
//! Constructed once, on the event-loop thread, before the first job is
//! accepted; held until the process exits. Caller threads never see any of
//! this except the bootstrapped root capability, and that only from inside
//! an injected job.

use anyhow::Context;
use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use futures::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

use crate::filesystem_capnp::rw_directory;

/// Environment variable naming the service endpoint: a `unix:`-prefixed
/// socket path, or a `host:port` pair.
pub const SERVER_ADDR_VAR: &str = "SANDSTORM_VFS_SERVER";

/// Connection state owned by the event-loop thread. Cloning just bumps the
/// capability refcount, so each job gets its own copy.
#[derive(Clone)]
pub struct LoopState {
    root: rw_directory::Client,
}

impl LoopState {
    /// Connect to the endpoint named by [`SERVER_ADDR_VAR`] and bootstrap
    /// the service's root directory. Any failure here is fatal to the
    /// process (the loop thread aborts).
    pub(crate) async fn connect() -> anyhow::Result<LoopState> {
        let addr = std::env::var(SERVER_ADDR_VAR)
            .with_context(|| format!("environment variable {SERVER_ADDR_VAR} undefined"))?;
        let (reader, writer) = connect_stream(&addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;

        let network = Box::new(twoparty::VatNetwork::new(
            reader,
            writer,
            rpc_twoparty_capnp::Side::Client,
            Default::default(),
        ));
        let mut rpc_system = RpcSystem::new(network, None);
        let root: rw_directory::Client =
            rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);

        // The RPC system pumps the connection for as long as the loop runs.
        // If the peer disconnects, in-flight and future calls fail and are
        // surfaced per-operation as EIO.
        tokio::task::spawn_local(async move {
            if let Err(e) = rpc_system.await {
                log::error!("rpc connection terminated: {e}");
            }
        });

        Ok(LoopState { root })
    }

    pub fn root(&self) -> &rw_directory::Client {
        &self.root
    }
}

type BoxedReader = Box<dyn AsyncRead + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin>;

async fn connect_stream(addr: &str) -> anyhow::Result<(BoxedReader, BoxedWriter)> {
    if let Some(path) = addr.strip_prefix("unix:") {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader.compat()), Box::new(writer.compat_write())))
    } else {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader.compat()), Box::new(writer.compat_write())))
    }
}
