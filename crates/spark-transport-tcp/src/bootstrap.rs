use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpSocket, TcpStream as TokioTcpStream};
use tokio::sync::Mutex as AsyncMutex;
use std::sync::Arc;

use crate::channel::{ChannelRegistry, TcpChannel, TcpSocketConfig};
use crate::error::TransportError;

/// Socket-level options applied before a connect attempt, plus the
/// per-crate channel registry every successful connect attaches through.
///
/// Mutation is serialized with an internal lock because, like Netty's
/// bootstrap, the options are a single shared value callers can reconfigure
/// between calls; without the lock, two concurrent `connect` calls could
/// observe a half-updated option set. The lock only guards the snapshot
/// read/write — the connect future itself is awaited outside it, so
/// concurrent connects still proceed in parallel.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub reuse_addr: bool,
    pub connect_timeout: Duration,
    /// Kept as a configuration-surface flag: see DESIGN.md for why both
    /// values resolve to the same implementation under Tokio.
    pub native_epoll: bool,
    pub socket: TcpSocketConfig,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            connect_timeout: Duration::from_millis(3000),
            native_epoll: true,
            socket: TcpSocketConfig::default(),
        }
    }
}

/// C8: configures socket options and installs the pipeline (here: the
/// [`ChannelRegistry`] every connected stream attaches through) for new
/// outbound connections.
#[derive(Clone)]
pub struct ConnectorBootstrap {
    options: Arc<Mutex<BootstrapOptions>>,
    registry: ChannelRegistry,
}

impl ConnectorBootstrap {
    pub fn new(options: BootstrapOptions) -> Self {
        Self {
            options: Arc::new(Mutex::new(options)),
            registry: ChannelRegistry::new(),
        }
    }

    /// The registry every connect attempt through this bootstrap attaches
    /// its stream through.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Replace the bootstrap's options; serialized against concurrent
    /// readers with the same lock `connect` uses for its snapshot.
    pub fn set_options(&self, options: BootstrapOptions) {
        *self.options.lock() = options;
    }

    fn snapshot(&self) -> BootstrapOptions {
        self.options.lock().clone()
    }

    /// Synchronous path: waits for the connect future, propagating failure
    /// as [`TransportError::ConnectFailed`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpChannel, TransportError> {
        let options = self.snapshot();
        Self::do_connect(addr, &options, &self.registry).await
    }

    /// Asynchronous path: spawns the connect attempt and returns
    /// immediately; completion is observable through `on_done` (in
    /// production, a [`crate::channel_group::ChannelGroup`] callback).
    pub fn connect_async<F>(&self, addr: SocketAddr, on_done: F)
    where
        F: FnOnce(Result<TcpChannel, TransportError>) + Send + 'static,
    {
        let options = self.snapshot();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let result = Self::do_connect(addr, &options, &registry).await;
            on_done(result);
        });
    }

    async fn do_connect(
        addr: SocketAddr,
        options: &BootstrapOptions,
        registry: &ChannelRegistry,
    ) -> Result<TcpChannel, TransportError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(TransportError::Configure)?;
        socket
            .set_reuseaddr(options.reuse_addr)
            .map_err(TransportError::Configure)?;

        let stream: TokioTcpStream =
            match tokio::time::timeout(options.connect_timeout, socket.connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(TransportError::ConnectFailed {
                        addr: addr.to_string(),
                        source,
                    });
                }
                Err(_elapsed) => {
                    return Err(TransportError::ConnectFailed {
                        addr: addr.to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "connect_timeout_millis exceeded",
                        ),
                    });
                }
            };

        let local_addr = stream.local_addr().map_err(TransportError::Configure)?;
        let peer_addr = stream.peer_addr().map_err(TransportError::Configure)?;
        registry.attach(
            Arc::new(AsyncMutex::new(stream)),
            local_addr,
            peer_addr,
            options.socket.clone(),
        )
    }
}
