use std::io;
use std::net::{Shutdown as StdShutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream as TokioTcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::backpressure::BackpressureState;
use crate::error::TransportError;

/// Half-close direction for [`TcpChannel::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

/// Socket-level options applied once, at attach time.
///
/// Mirrors the teacher's `TcpSocketConfig`: a small value object so callers
/// never touch `socket2` directly. `SO_REUSEADDR` and the connect timeout
/// live on [`crate::bootstrap::BootstrapOptions`] instead, since those only
/// matter before a stream exists; `linger` is the one option meaningful on
/// an already-established stream, so this crate splits them by when they
/// apply.
#[derive(Clone, Debug, Default)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self { linger: None }
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    fn apply(&self, stream: &TokioTcpStream) -> io::Result<()> {
        SockRef::from(stream).set_linger(self.linger)
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct TcpChannelInner {
    id: u64,
    stream: Arc<AsyncMutex<TokioTcpStream>>,
    backpressure: Mutex<BackpressureState>,
    active: AtomicBool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: TcpSocketConfig,
    io_task: Mutex<Option<tokio::task::Id>>,
}

/// C5: a thin, identity-preserving wrapper over a live TCP stream.
///
/// Two handles compare equal iff they wrap the same stream: here that's
/// `Arc::ptr_eq` on the shared inner, which is exactly what
/// [`ChannelRegistry::attach`] guarantees stays singular for a stream's
/// lifetime.
#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<TcpChannelInner>,
}

impl PartialEq for TcpChannel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for TcpChannel {}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .finish()
    }
}

impl std::fmt::Display for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tcp#{}[{}->{}]",
            self.inner.id, self.inner.local_addr, self.inner.peer_addr
        )
    }
}

impl TcpChannel {
    /// Process-wide, monotonically assigned identity — stable for the life
    /// of the underlying stream, independent of `Clone`.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Address this end of the stream is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Socket options this channel was attached with.
    pub fn config(&self) -> &TcpSocketConfig {
        &self.inner.config
    }

    /// Reflects live state; never cached.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.inner.backpressure.lock().is_writable()
    }

    /// True iff the caller is running on the task that owns this channel's
    /// read loop. A channel with no read loop spawned yet (e.g.
    /// one that hasn't been handed to a watchdog) is never "on the I/O
    /// thread".
    pub fn is_io_thread(&self) -> bool {
        match (*self.inner.io_task.lock(), tokio::task::try_id()) {
            (Some(owner), Some(current)) => owner == current,
            _ => false,
        }
    }

    /// Records the task driving this channel's read loop, so
    /// [`TcpChannel::is_io_thread`] has something to compare against.
    /// Called once by whoever spawns that loop (the watchdog).
    pub(crate) fn bind_io_task(&self, id: tokio::task::Id) {
        *self.inner.io_task.lock() = Some(id);
    }

    /// Reads into `buf`, growing it as needed. Returns `0` on a clean EOF.
    pub async fn read(&self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        if !self.is_active() {
            return Err(TransportError::StreamInactive);
        }
        let mut guard = self.inner.stream.lock().await;
        match guard.read_buf(buf).await {
            Ok(n) => {
                if n == 0 {
                    self.inner.active.store(false, Ordering::Release);
                }
                Ok(n)
            }
            Err(err) => {
                self.inner.active.store(false, Ordering::Release);
                Err(TransportError::Io {
                    op: "read",
                    source: err,
                })
            }
        }
    }

    /// Writes the entirety of `buf` and flushes. Non-blocking from the
    /// caller's point of view is achieved one layer up, in
    /// [`TcpChannel::write`]/[`TcpChannel::write_with_listener`] — this is
    /// the plain async primitive they spawn onto a task.
    pub async fn write_and_flush(&self, mut buf: impl Buf + Send) -> Result<usize, TransportError> {
        if !self.is_active() {
            return Err(TransportError::StreamInactive);
        }
        let mut guard = self.inner.stream.lock().await;
        let mut total = 0usize;
        while buf.has_remaining() {
            match guard.write(buf.chunk()).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.advance(n);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    drop(guard);
                    self.inner.backpressure.lock().on_would_block();
                    return Ok(total);
                }
                Err(err) => {
                    self.inner.active.store(false, Ordering::Release);
                    return Err(TransportError::Io {
                        op: "write",
                        source: err,
                    });
                }
            }
        }
        guard
            .flush()
            .await
            .map_err(|source| TransportError::Io { op: "flush", source })?;
        drop(guard);
        self.inner.backpressure.lock().on_ready();
        Ok(total)
    }

    /// Enqueues a write-and-flush on a background task and returns
    /// immediately; backpressure is surfaced via [`TcpChannel::is_writable`],
    /// never by blocking the caller.
    pub fn write(&self, msg: bytes::Bytes) {
        self.write_with_listener(msg, |_channel, _result| {});
    }

    pub fn write_with_listener<F>(&self, msg: bytes::Bytes, listener: F)
    where
        F: FnOnce(&TcpChannel, Result<usize, TransportError>) + Send + 'static,
    {
        let channel = self.clone();
        tokio::spawn(async move {
            let result = channel.write_and_flush(msg).await;
            listener(&channel, result);
        });
    }

    pub async fn shutdown(&self, direction: ShutdownDirection) -> Result<(), TransportError> {
        let mut guard = self.inner.stream.lock().await;
        let result = match direction {
            ShutdownDirection::Write => AsyncWriteExt::shutdown(&mut *guard).await,
            ShutdownDirection::Read => sync_shutdown(&guard, StdShutdown::Read),
            ShutdownDirection::Both => {
                AsyncWriteExt::shutdown(&mut *guard).await?;
                sync_shutdown(&guard, StdShutdown::Both)
            }
        };
        drop(guard);
        self.inner.active.store(false, Ordering::Release);
        result.map_err(|source| TransportError::Io {
            op: "shutdown",
            source,
        })
    }

    /// Initiates a close; returns immediately, non-blocking.
    pub fn close(&self) -> Self {
        self.close_with_listener(|_channel, _success| {})
    }

    pub fn close_with_listener<F>(&self, listener: F) -> Self
    where
        F: FnOnce(&TcpChannel, bool) + Send + 'static,
    {
        let channel = self.clone();
        tokio::spawn(async move {
            let success = channel.shutdown(ShutdownDirection::Both).await.is_ok();
            listener(&channel, success);
        });
        self.clone()
    }
}

fn sync_shutdown(stream: &TokioTcpStream, direction: StdShutdown) -> io::Result<()> {
    SockRef::from(stream).shutdown(direction)
}

/// Process-wide attribute slot for TCP streams (C5's "attach" contract).
///
/// Grounded in the design note: "if the host transport does not provide
/// [a per-stream attribute slot], use an externally keyed concurrent map
/// from stream identity to handle, with weak-by-identity semantics".
/// `stream identity` here is the pointer identity of the
/// `Arc<Mutex<TcpStream>>` the caller already shares across the threads
/// racing to attach — not the raw fd, since multiple `TcpStream` values can
/// never actually share an fd, so the only real race is over a
/// caller-shared `Arc`. Entries are `Weak`, so a dropped channel's slot
/// self-evicts without an explicit `detach`.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    slots: Arc<DashMap<usize, Weak<TcpChannelInner>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unique handle for `stream`, creating it on first call.
    /// Safe under concurrent callers sharing the same `stream` handle: the
    /// `DashMap` shard lock inside `entry()` is the compare-and-set, and a
    /// caller who loses the race simply discards its candidate `Arc` and
    /// returns the winner's.
    pub fn attach(
        &self,
        stream: Arc<AsyncMutex<TokioTcpStream>>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: TcpSocketConfig,
    ) -> Result<TcpChannel, TransportError> {
        let key = Arc::as_ptr(&stream) as usize;
        if let Some(existing) = self.slots.get(&key).and_then(|weak| weak.upgrade()) {
            return Ok(TcpChannel { inner: existing });
        }

        {
            let guard = stream.try_lock();
            if let Ok(guard) = guard {
                config
                    .apply(&guard)
                    .map_err(TransportError::Configure)?;
            }
            // If the mutex is already held (another thread racing to attach
            // the same stream is mid-construction), skip applying socket
            // options here; the winner's construction already did it, or
            // will when it gets its turn.
        }

        let candidate = Arc::new(TcpChannelInner {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            backpressure: Mutex::new(BackpressureState::new()),
            active: AtomicBool::new(true),
            local_addr,
            peer_addr,
            config,
            io_task: Mutex::new(None),
        });

        let winner = match self.slots.entry(key) {
            Entry::Occupied(mut slot) => match slot.get().upgrade() {
                Some(existing) => existing,
                None => {
                    slot.insert(Arc::downgrade(&candidate));
                    candidate
                }
            },
            Entry::Vacant(slot) => {
                slot.insert(Arc::downgrade(&candidate));
                candidate
            }
        };
        Ok(TcpChannel { inner: winner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tokio::join;

    async fn connected_pair() -> (Arc<AsyncMutex<TokioTcpStream>>, SocketAddr, SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let (client, server) = join!(TokioTcpStream::connect(local_addr), listener.accept());
        let (server_stream, peer_addr) = server.unwrap();
        drop(client.unwrap());
        (
            Arc::new(AsyncMutex::new(server_stream)),
            local_addr,
            peer_addr,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attach_is_idempotent_for_the_same_stream() {
        let registry = ChannelRegistry::new();
        let (stream, local, peer) = connected_pair().await;

        let a = registry
            .attach(Arc::clone(&stream), local, peer, TcpSocketConfig::default())
            .unwrap();
        let b = registry
            .attach(stream, local, peer, TcpSocketConfig::default())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sixteen_concurrent_attaches_yield_one_handle() {
        let registry = Arc::new(ChannelRegistry::new());
        let (stream, local, peer) = connected_pair().await;
        let barrier = Arc::new(Barrier::new(16));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let stream = Arc::clone(&stream);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait();
                registry
                    .attach(stream, local, peer, TcpSocketConfig::default())
                    .unwrap()
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        let first = &handles[0];
        assert!(handles.iter().all(|h| h == first));
        assert_eq!(
            handles.iter().map(|h| h.id()).collect::<std::collections::HashSet<_>>().len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_then_read_round_trips_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let (client, server) = join!(TokioTcpStream::connect(local_addr), listener.accept());
        let (server_stream, peer_addr) = server.unwrap();

        let registry = ChannelRegistry::new();
        let server_channel = registry
            .attach(
                Arc::new(AsyncMutex::new(server_stream)),
                local_addr,
                peer_addr,
                TcpSocketConfig::default(),
            )
            .unwrap();

        let mut client_stream = client.unwrap();
        client_stream.write_all(b"ping").await.unwrap();
        client_stream.flush().await.unwrap();

        let mut buf = BytesMut::with_capacity(16);
        let mut total = 0;
        while total < 4 {
            total += server_channel.read(&mut buf).await.unwrap();
        }
        assert_eq!(&buf[..], b"ping");
    }
}
