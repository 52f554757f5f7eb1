use std::io;

use thiserror::Error;

/// Error kinds raised by this crate.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed { addr: String, source: io::Error },

    /// Returned by [`crate::channel::TcpChannel::read`]/`write_and_flush`
    /// when called after the stream has already gone inactive (EOF, a
    /// prior I/O error, or an explicit shutdown).
    #[error("channel is not active")]
    StreamInactive,

    #[error("failed to apply socket option: {0}")]
    Configure(#[source] io::Error),

    #[error("io error during {op}: {source}")]
    Io {
        op: &'static str,
        source: io::Error,
    },
}
