use std::time::{Duration, Instant};

/// Write-path backpressure tracker, surfaced through [`crate::TcpChannel::is_writable`].
///
/// Counts consecutive `WouldBlock`s rather than reacting to a single one, so
/// a channel doesn't flicker busy/ready on an isolated stall. The count
/// decays once the last event is older than [`WOULD_BLOCK_DECAY`], so a
/// channel that stops writing for a while comes back up as writable without
/// needing an explicit reset.
#[derive(Debug)]
pub(crate) struct BackpressureState {
    consecutive_would_block: u32,
    last_event: Option<Instant>,
}

const WOULD_BLOCK_DECAY: Duration = Duration::from_millis(250);
const BUSY_THRESHOLD: u32 = 3;

impl BackpressureState {
    pub(crate) fn new() -> Self {
        Self {
            consecutive_would_block: 0,
            last_event: None,
        }
    }

    pub(crate) fn on_ready(&mut self) {
        self.consecutive_would_block = 0;
        self.last_event = None;
    }

    pub(crate) fn on_would_block(&mut self) {
        self.consecutive_would_block = self.consecutive_would_block.saturating_add(1);
        self.last_event = Some(Instant::now());
    }

    pub(crate) fn is_writable(&mut self) -> bool {
        if let Some(last) = self.last_event
            && last.elapsed() > WOULD_BLOCK_DECAY
        {
            self.consecutive_would_block = 0;
            self.last_event = None;
        }
        self.consecutive_would_block < BUSY_THRESHOLD
    }
}
