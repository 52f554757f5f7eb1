//! Bounded, work-stealing task dispatcher used to move response processing
//! and user callbacks off an I/O thread.
//!
//! Three pieces, composed by [`Executor`]:
//! - [`WaitPolicy`] — how an idle consumer waits.
//! - [`RingDispatcher`] — the lock-free MPMC ring itself.
//! - [`ReservePool`] — elastic overflow for dispatches the ring rejects.

mod dispatcher;
mod error;
mod executor;
mod reserve;
mod ring;
mod task;
mod wait_policy;

pub use error::{DispatchError, ExecuteError};
pub use executor::{Executor, ExecutorConfig};
pub use dispatcher::DispatcherConfig;
pub use task::Task;
pub use wait_policy::WaitPolicy;
