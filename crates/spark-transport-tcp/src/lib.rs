//! Reconnecting TCP client transport: channel handles, connection watchdog,
//! connector bootstrap, and the recyclable response task that carries a
//! decoded reply from an I/O thread onto a [`spark_dispatch::Executor`].
//!
//! - [`channel`] — C5 `TcpChannel`, the identity-preserving handle over a
//!   live stream, plus the [`channel::ChannelRegistry`] that implements
//!   attach-exactly-once.
//! - [`decoder`] — the per-connection framing seam inbound bytes pass
//!   through before a [`response_task::RecyclableResponseTask`] is built.
//! - [`response_task`] — C6, the pooled unit of work moving from an I/O
//!   thread to a dispatcher worker.
//! - [`bootstrap`] — C8 `ConnectorBootstrap`, socket options and the
//!   synchronous/asynchronous connect paths.
//! - [`watchdog`] — C7 `ConnectionWatchdog`, the reconnecting state machine
//!   binding a logical endpoint to a physical stream.
//! - [`channel_group`] / [`serializer`] — external collaborator interfaces
//!   this crate references but does not design: channel-group membership
//!   and payload (de)serialization are owned elsewhere.

mod backpressure;
pub mod bootstrap;
pub mod channel;
pub mod channel_group;
pub mod decoder;
mod error;
pub mod response_task;
pub mod serializer;
pub mod watchdog;

pub use bootstrap::{BootstrapOptions, ConnectorBootstrap};
pub use channel::{ChannelRegistry, ShutdownDirection, TcpChannel, TcpSocketConfig};
pub use channel_group::ChannelGroup;
pub use decoder::{FrameDecoder, LengthPrefixedDecoder};
pub use error::TransportError;
pub use response_task::{RawResponse, RecyclableResponseTask, ResponseTaskPool};
pub use serializer::{DecodedResponse, PendingInvocations, SerializationError, Serializer};
pub use watchdog::{ConnectionWatchdog, DecoderFactory, EndpointState};
