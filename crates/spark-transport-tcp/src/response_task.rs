use std::sync::Arc;
use std::thread::ThreadId;

use bytes::Bytes;
use dashmap::DashMap;
use spark_dispatch::Task;

use crate::channel::TcpChannel;
use crate::serializer::{DecodedResponse, PendingInvocations, Serializer};

/// A framed response as the decoder hands it off, before deserialization.
pub struct RawResponse {
    pub request_id: u64,
    pub bytes: Bytes,
}

/// The two fields a [`RecyclableResponseTask`] carries through the
/// dispatcher (C2). Boxed so the pool can hand out a stable allocation
/// across many acquire/release cycles instead of reallocating per task.
#[derive(Default)]
struct Slot {
    channel: Option<TcpChannel>,
    response: Option<RawResponse>,
}

impl Slot {
    fn is_clear(&self) -> bool {
        self.channel.is_none() && self.response.is_none()
    }
}

/// Thread-local free list with a shared cross-thread handoff.
///
/// Each shard is keyed by the [`ThreadId`] that first acquired from it —
/// typically an I/O thread, since that's where `acquire` is called from in
/// the data-flow this crate implements. `release` always targets the shard
/// a task was acquired from (carried as an opaque token on the task), even
/// when the release happens on a different thread (a dispatcher worker),
/// matching the "shared cross-thread handoff" requirement.
#[derive(Clone)]
pub struct ResponseTaskPool {
    shards: Arc<DashMap<ThreadId, Shard>>,
    shard_capacity: usize,
}

struct Shard {
    sender: flume::Sender<Box<Slot>>,
    receiver: flume::Receiver<Box<Slot>>,
}

impl ResponseTaskPool {
    /// `shard_capacity` bounds how many freed slots each thread's shard
    /// holds onto; `0` is treated as `1` so every shard can hold at least
    /// the slot it just freed.
    pub fn new(shard_capacity: usize) -> Self {
        Self {
            shards: Arc::new(DashMap::new()),
            shard_capacity: shard_capacity.max(1),
        }
    }

    /// Obtain a task carrying `(channel, response)`, reusing a freed slot
    /// from the calling thread's shard when one is available.
    pub fn acquire(
        &self,
        channel: TcpChannel,
        response: RawResponse,
        serializer: Arc<dyn Serializer>,
        registry: Arc<dyn PendingInvocations>,
    ) -> RecyclableResponseTask {
        let shard_key = std::thread::current().id();
        let mut slot = self
            .shards
            .entry(shard_key)
            .or_insert_with(|| {
                let (sender, receiver) = flume::bounded(self.shard_capacity);
                Shard { sender, receiver }
            })
            .receiver
            .try_recv()
            .unwrap_or_default();

        debug_assert!(slot.is_clear());
        slot.channel = Some(channel);
        slot.response = Some(response);

        RecyclableResponseTask {
            slot: Some(slot),
            shard_key,
            pool: self.clone(),
            serializer,
            registry,
        }
    }

    fn release(&self, shard_key: ThreadId, mut slot: Box<Slot>) {
        slot.channel = None;
        slot.response = None;
        if let Some(shard) = self.shards.get(&shard_key) {
            // A full shard means there's already a spare; drop this one
            // rather than block — the pool is a latency optimization, not
            // a hard capacity limit.
            let _ = shard.sender.try_send(slot);
        }
    }
}

/// C6: the unit of work that moves from an I/O thread to a dispatcher
/// worker, carrying one decoded response through to the pending-invocation
/// registry.
pub struct RecyclableResponseTask {
    slot: Option<Box<Slot>>,
    shard_key: ThreadId,
    pool: ResponseTaskPool,
    serializer: Arc<dyn Serializer>,
    registry: Arc<dyn PendingInvocations>,
}

impl Task for RecyclableResponseTask {
    fn run(self: Box<Self>) {
        let Self {
            mut slot,
            shard_key,
            pool,
            serializer,
            registry,
        } = *self;

        // Guaranteed-release: whatever happens inside this closure (decode
        // failure, a panic in a user callback reached through `registry`),
        // `guard`'s Drop still clears and returns the slot before `run`
        // returns or unwinds.
        struct ReleaseOnDrop<'a> {
            pool: &'a ResponseTaskPool,
            shard_key: ThreadId,
            slot: &'a mut Option<Box<Slot>>,
        }
        impl Drop for ReleaseOnDrop<'_> {
            fn drop(&mut self) {
                if let Some(slot) = self.slot.take() {
                    self.pool.release(self.shard_key, slot);
                }
            }
        }
        let guard = ReleaseOnDrop {
            pool: &pool,
            shard_key,
            slot: &mut slot,
        };

        let Some(inner) = guard.slot.as_mut() else {
            return;
        };
        let channel = inner.channel.clone().expect("acquired task always has a channel");
        let mut response = inner.response.take().expect("acquired task always has a response");
        let bytes = std::mem::take(&mut response.bytes);

        match serializer.decode(bytes) {
            Ok(payload) => registry.received(
                &channel,
                DecodedResponse {
                    request_id: response.request_id,
                    payload,
                },
            ),
            Err(err) => {
                tracing::error!(
                    channel = %channel,
                    request_id = response.request_id,
                    error = %err,
                    "response deserialization failed; swallowing"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_group::ChannelGroup;
    use crate::channel_group::test_support::InMemoryChannelGroup;
    use crate::serializer::test_support::{EchoSerializer, RecordingRegistry};
    use std::net::SocketAddr;

    fn dummy_channel() -> TcpChannel {
        // Tasks only need a channel's identity for these tests; build one
        // through the registry exactly as connect() would.
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let local_addr: SocketAddr = listener.local_addr().unwrap();
            let (client, server) = tokio::join!(
                tokio::net::TcpStream::connect(local_addr),
                listener.accept()
            );
            let (server_stream, peer_addr) = server.unwrap();
            drop(client.unwrap());
            let registry = crate::channel::ChannelRegistry::new();
            registry
                .attach(
                    Arc::new(tokio::sync::Mutex::new(server_stream)),
                    local_addr,
                    peer_addr,
                    crate::channel::TcpSocketConfig::default(),
                )
                .unwrap()
        })
    }

    #[test]
    fn returned_task_has_both_fields_cleared() {
        let pool = ResponseTaskPool::new(4);
        let channel = dummy_channel();
        let registry = Arc::new(RecordingRegistry::default());
        let serializer = Arc::new(EchoSerializer);

        let task = pool.acquire(
            channel,
            RawResponse {
                request_id: 42,
                bytes: Bytes::from_static(b"payload"),
            },
            serializer,
            registry.clone(),
        );
        let boxed: Box<dyn Task> = Box::new(task);
        boxed.run();

        assert_eq!(registry.received.lock().as_slice(), &[42]);

        // Acquire again on the same thread: must reuse the freed slot
        // (hand back a Default-equivalent, clear, slot) rather than a fresh
        // allocation that happens to also be clear.
        let shard_key = std::thread::current().id();
        let shard = pool.shards.get(&shard_key).unwrap();
        let reused = shard.receiver.try_recv().expect("slot was returned to the pool");
        assert!(reused.is_clear());
    }

    #[test]
    fn channel_group_add_remove() {
        let group = InMemoryChannelGroup::default();
        let channel = dummy_channel();
        group.on_connected(channel.clone());
        assert_eq!(group.len(), 1);
        group.on_disconnected(&channel);
        assert_eq!(group.len(), 0);
    }
}
