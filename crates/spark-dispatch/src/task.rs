/// A unit of work a [`crate::executor::Executor`] can run.
///
/// Ordinary closures implement this directly; [`crate::reserve::ReservePool`]
/// and [`crate::dispatcher::RingDispatcher`] only ever see `Box<dyn Task>`, so
/// a pooled/recyclable task type (see `spark-transport-tcp::task`) can
/// implement it too without either crate knowing about object recycling.
pub trait Task: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F> Task for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// Runs `item`, catching any panic and handing it to `on_panic` instead of
/// unwinding across the worker thread — a worker must survive a bad task.
pub(crate) fn run_caught(item: Box<dyn Task>, on_panic: &dyn Fn(Box<dyn std::any::Any + Send>)) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| item.run()));
    if let Err(payload) = result {
        on_panic(payload);
    }
}
