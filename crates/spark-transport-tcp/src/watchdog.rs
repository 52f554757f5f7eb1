use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::bootstrap::ConnectorBootstrap;
use crate::channel::TcpChannel;
use crate::channel_group::ChannelGroup;
use crate::decoder::FrameDecoder;
use crate::response_task::ResponseTaskPool;
use crate::serializer::{PendingInvocations, Serializer};
use spark_dispatch::Executor;

/// C7's state machine, `{Idle, Connecting, Connected, Reconnecting, Closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closed = 4,
}

impl EndpointState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }
}

/// Bounded exponential backoff, `1s * 2^attempt` capped at 30s (see
/// DESIGN.md's Open Question resolutions for why this curve was picked).
fn backoff_delay(attempt: u32) -> Duration {
    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(30);
    BASE.saturating_mul(1u32.checked_shl(attempt.min(5)).unwrap_or(u32::MAX))
        .min(CAP)
}

/// Builds a fresh [`FrameDecoder`] for each new connection — decoders hold
/// per-stream framing state, so a watchdog surviving many reconnects needs
/// a new one every time, never a shared one.
pub trait DecoderFactory: Send + Sync {
    fn new_decoder(&self) -> Box<dyn FrameDecoder>;
}

impl<F> DecoderFactory for F
where
    F: Fn() -> Box<dyn FrameDecoder> + Send + Sync,
{
    fn new_decoder(&self) -> Box<dyn FrameDecoder> {
        (self)()
    }
}

struct Inner {
    addr: SocketAddr,
    state: AtomicU8,
    reconnect_enabled: AtomicBool,
    native_epoll: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown_notify: tokio::sync::Notify,
    backoff_attempt: AtomicU32,
    current: Mutex<Option<TcpChannel>>,
    bootstrap: ConnectorBootstrap,
    channel_group: Arc<dyn ChannelGroup>,
    executor: Executor,
    response_pool: ResponseTaskPool,
    serializer: Arc<dyn Serializer>,
    registry: Arc<dyn PendingInvocations>,
    decoder_factory: Arc<dyn DecoderFactory>,
}

/// C7: a stateful pipeline entry owning the reconnect policy for one
/// `(endpoint, channel-group)` pair. Sharable and idempotent across
/// attachment to multiple streams over time — every reconnect rebuilds the
/// per-connection decoder and read loop while reusing the same shared
/// `ChannelGroup` and `Executor` handed to it at construction.
#[derive(Clone)]
pub struct ConnectionWatchdog {
    inner: Arc<Inner>,
}

impl ConnectionWatchdog {
    /// Builds a watchdog for `addr`, starting in [`EndpointState::Idle`].
    /// None of `bootstrap`/`channel_group`/`executor`/`response_pool`/
    /// `serializer`/`registry`/`decoder_factory` are touched until
    /// [`ConnectionWatchdog::connect`] is called.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: SocketAddr,
        bootstrap: ConnectorBootstrap,
        channel_group: Arc<dyn ChannelGroup>,
        executor: Executor,
        response_pool: ResponseTaskPool,
        serializer: Arc<dyn Serializer>,
        registry: Arc<dyn PendingInvocations>,
        decoder_factory: Arc<dyn DecoderFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr,
                state: AtomicU8::new(EndpointState::Idle as u8),
                reconnect_enabled: AtomicBool::new(true),
                native_epoll: AtomicBool::new(true),
                shutdown_requested: AtomicBool::new(false),
                shutdown_notify: tokio::sync::Notify::new(),
                backoff_attempt: AtomicU32::new(0),
                current: Mutex::new(None),
                bootstrap,
                channel_group,
                executor,
                response_pool,
                serializer,
                registry,
                decoder_factory,
            }),
        }
    }

    /// Current state; always a fresh load, never cached by the caller.
    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EndpointState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Idempotent and observable immediately: a single relaxed store, no
    /// CAS loop needed since `reconnect_enabled` is independent of the
    /// packed state byte.
    pub fn set_reconnect(&self, enabled: bool) {
        self.inner.reconnect_enabled.store(enabled, Ordering::Release);
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.inner.reconnect_enabled.load(Ordering::Acquire)
    }

    /// Configuration-surface toggle only; see DESIGN.md for why both values
    /// resolve to the same I/O implementation under Tokio.
    pub fn set_native_epoll(&self, enabled: bool) {
        self.inner.native_epoll.store(enabled, Ordering::Release);
    }

    /// The live channel, if any — `None` while `Idle`, `Connecting`,
    /// `Reconnecting`, or `Closed`.
    pub fn current_channel(&self) -> Option<TcpChannel> {
        self.inner.current.lock().clone()
    }

    /// `Idle -> Connecting` on `connect()`. Does not block the caller —
    /// the connect attempt and the subsequent read loop run on a spawned
    /// task; reconnects are driven from the same task after it returns.
    pub fn connect(&self) {
        self.set_state(EndpointState::Connecting);
        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.run().await });
    }

    /// Any state `-> Closed`. Breaks the current read loop by shutting the
    /// live stream down, which is what actually unblocks the task in `run`.
    pub fn shutdown(&self) {
        self.inner.shutdown_requested.store(true, Ordering::Release);
        self.set_reconnect(false);
        self.inner.shutdown_notify.notify_waiters();
        if let Some(channel) = self.inner.current.lock().clone() {
            let _ = channel.close();
        }
    }

    async fn run(&self) {
        loop {
            if self.inner.shutdown_requested.load(Ordering::Acquire) {
                self.set_state(EndpointState::Closed);
                return;
            }

            match self.inner.bootstrap.connect(self.inner.addr).await {
                Ok(channel) => {
                    self.set_state(EndpointState::Connected);
                    self.inner.backoff_attempt.store(0, Ordering::Relaxed);
                    *self.inner.current.lock() = Some(channel.clone());
                    self.inner.channel_group.on_connected(channel.clone());

                    self.run_read_loop(&channel).await;

                    self.inner.channel_group.on_disconnected(&channel);
                    *self.inner.current.lock() = None;
                }
                Err(err) => {
                    tracing::warn!(addr = %self.inner.addr, error = %err, "connect attempt failed");
                }
            }

            if self.inner.shutdown_requested.load(Ordering::Acquire)
                || !self.reconnect_enabled()
            {
                self.set_state(EndpointState::Closed);
                return;
            }

            self.set_state(EndpointState::Reconnecting);
            let attempt = self.inner.backoff_attempt.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                _ = self.inner.shutdown_notify.notified() => {}
            }

            if self.inner.shutdown_requested.load(Ordering::Acquire)
                || !self.reconnect_enabled()
            {
                self.set_state(EndpointState::Closed);
                return;
            }
            self.set_state(EndpointState::Connecting);
        }
    }

    /// Spawns (inline, on the calling task) the per-connection read loop: a
    /// fresh [`FrameDecoder`] for this stream, handing every decoded frame
    /// to the shared [`Executor`] as a `RecyclableResponseTask`. Returns
    /// once the stream goes inactive (clean EOF or an I/O error), handing
    /// control back to the reconnect loop.
    async fn run_read_loop(&self, channel: &TcpChannel) {
        channel.bind_io_task(tokio::task::id());
        let mut decoder = self.inner.decoder_factory.new_decoder();
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match channel.read(&mut buf).await {
                Ok(0) => return,
                Ok(_) => {
                    while let Some(frame) = decoder.decode(&mut buf) {
                        let task = self.inner.response_pool.acquire(
                            channel.clone(),
                            frame,
                            Arc::clone(&self.inner.serializer),
                            Arc::clone(&self.inner.registry),
                        );
                        if let Err(err) = self.inner.executor.execute(task) {
                            tracing::error!(channel = %channel, error = %err, "failed to dispatch response task");
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(channel = %channel, error = %err, "channel read failed; treating as inactive");
                    return;
                }
            }
        }
    }
}
