//! Hysteresis for channel pool growth.
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Counts empty polls of a sub-pool and decides when the starvation is sustained enough to grow.
///
/// A growth event fires once `threshold` empty polls are observed within `window`; the count
/// then starts over, so a single burst of contention triggers at most one growth event.
pub(crate) struct StarvationTracker {
    threshold: u32,
    window: Duration,
    state: Mutex<StarvationWindow>,
}

#[derive(Default)]
struct StarvationWindow {
    started: Option<Instant>,
    misses: u32,
}

impl StarvationTracker {
    pub(crate) fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            state: Mutex::new(StarvationWindow::default()),
        }
    }

    /// Record an empty poll. Returns `true` if this poll completes a growth trigger.
    pub(crate) fn record_miss(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.started {
            Some(started) if now.duration_since(started) <= self.window => {}
            _ => {
                state.started = Some(now);
                state.misses = 0;
            }
        }
        state.misses += 1;
        if state.misses >= self.threshold {
            *state = StarvationWindow::default();
            true
        } else {
            false
        }
    }
}
