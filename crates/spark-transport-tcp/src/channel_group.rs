use crate::channel::TcpChannel;

/// The multiplexing set of live handles sharing a remote address.
///
/// Load balancing across a group is explicitly out of scope for this crate;
/// [`ConnectionWatchdog`](crate::watchdog::ConnectionWatchdog) only ever
/// adds on connect and removes on close, per its lifecycle contract.
pub trait ChannelGroup: Send + Sync {
    fn on_connected(&self, channel: TcpChannel);
    fn on_disconnected(&self, channel: &TcpChannel);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use dashmap::DashSet;
    use std::sync::Arc;

    /// Minimal in-memory group, enough to exercise the watchdog's reconnect
    /// contract in tests. Not production API surface.
    #[derive(Default, Clone)]
    pub struct InMemoryChannelGroup {
        live: Arc<DashSet<u64>>,
    }

    impl InMemoryChannelGroup {
        pub fn live_ids(&self) -> Vec<u64> {
            self.live.iter().map(|id| *id).collect()
        }

        pub fn len(&self) -> usize {
            self.live.len()
        }
    }

    impl ChannelGroup for InMemoryChannelGroup {
        fn on_connected(&self, channel: TcpChannel) {
            self.live.insert(channel.id());
        }

        fn on_disconnected(&self, channel: &TcpChannel) {
            self.live.remove(&channel.id());
        }
    }
}
