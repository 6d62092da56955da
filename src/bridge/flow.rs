//! Per-direction flow control
//!
//! A [`FlowGate`] counts bytes read from a source but not yet written to
//! its sink. Crossing the high-water mark pauses the source; dropping
//! under the resume threshold lets it read again.

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLimits {
    /// Buffered bytes above which the source is paused
    pub high_water_mark: usize,
    /// Buffered bytes below which a paused source resumes
    pub resume_at: usize,
    /// Bound on bytes held while a session waits for its peer
    pub max_pending: usize,
}

impl FlowLimits {
    pub fn new(high_water_mark: usize, max_pending: usize) -> Self {
        Self {
            high_water_mark,
            resume_at: high_water_mark / 2,
            max_pending,
        }
    }
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self::new(64 * 1024, 1024 * 1024)
    }
}

#[derive(Debug, Default)]
struct GateState {
    buffered: usize,
    paused: bool,
}

#[derive(Debug)]
pub struct FlowGate {
    high_water_mark: usize,
    resume_at: usize,
    state: Mutex<GateState>,
    resumed: Notify,
}

impl FlowGate {
    pub fn new(limits: &FlowLimits) -> Self {
        Self {
            high_water_mark: limits.high_water_mark,
            resume_at: limits.resume_at,
            state: Mutex::new(GateState::default()),
            resumed: Notify::new(),
        }
    }

    /// Wait until the source may read again.
    pub async fn ready(&self) {
        loop {
            // Register before checking so a concurrent release can't slip between.
            let notified = self.resumed.notified();
            if !self.state.lock().paused {
                return;
            }
            notified.await;
        }
    }

    /// Account for `n` bytes handed to the sink.
    pub fn charge(&self, n: usize) {
        let mut state = self.state.lock();
        state.buffered += n;
        if !state.paused && state.buffered > self.high_water_mark {
            state.paused = true;
        }
    }

    /// Account for `n` bytes the sink has accepted.
    pub fn release(&self, n: usize) {
        let mut state = self.state.lock();
        state.buffered = state.buffered.saturating_sub(n);
        if state.paused && state.buffered < self.resume_at.max(1) {
            state.paused = false;
            drop(state);
            self.resumed.notify_waiters();
        }
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffered
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }
}
