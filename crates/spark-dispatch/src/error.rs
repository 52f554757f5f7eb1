use thiserror::Error;

/// Raised by [`crate::dispatcher::RingDispatcher::new`] when the requested
/// configuration cannot be honored at all (as opposed to being clamped or
/// rounded, which spec treats as the normal path).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("buf_size must be >= 1, got {buf_size}")]
    InvalidArgument { buf_size: i64 },
}

/// Raised by [`crate::executor::Executor::execute`] when neither the ring nor
/// the reserve pool (if any) could accept the task.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("{reason}")]
    Rejected { reason: &'static str },
}
