//! Session state tracking and reconnect pacing.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lifecycle of one tunnel session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshaking,
    Live,
    Closing,
    Closed,
}

/// Tracks the active session's state and traffic counters.
///
/// Observability only; the data plane itself runs on a single task and never
/// blocks on this.
pub struct SessionTracker {
    state: Mutex<SessionState>,
    live_since: Mutex<Option<Instant>>,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    sessions_established: AtomicU32,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Init),
            live_since: Mutex::new(None),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            sessions_established: AtomicU32::new(0),
        }
    }

    /// Transition to `new_state`, returning the previous state.
    pub fn transition(&self, new_state: SessionState) -> SessionState {
        let mut state = self.state.lock();
        let old_state = *state;

        match new_state {
            SessionState::Live => {
                *self.live_since.lock() = Some(Instant::now());
                self.sessions_established.fetch_add(1, Ordering::SeqCst);
            }
            SessionState::Closed | SessionState::Init => {
                *self.live_since.lock() = None;
            }
            _ => {}
        }

        *state = new_state;
        old_state
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// How long the current session has been live.
    pub fn live_duration(&self) -> Option<Duration> {
        self.live_since.lock().map(|t| t.elapsed())
    }

    pub fn record_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A tunnel packet discarded because the socket was congested.
    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            live_duration: self.live_duration(),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            sessions_established: self.sessions_established.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time session statistics.
#[derive(Clone, Debug)]
pub struct SessionStats {
    pub state: SessionState,
    pub live_duration: Option<Duration>,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub sessions_established: u32,
}

/// Fixed-delay reconnect pacing.
///
/// Session failures are expected to be transient NAT or connectivity events,
/// so the delay stays constant instead of growing exponentially; attempts are
/// unbounded.
pub struct ReconnectPacer {
    delay: Duration,
    attempts: AtomicU32,
}

impl ReconnectPacer {
    /// The baseline delay between reconnect attempts.
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            attempts: AtomicU32::new(0),
        }
    }

    /// Wait out one backoff period.
    pub async fn wait(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.delay).await;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Called after a successful handshake.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }
}

impl Default for ReconnectPacer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BACKOFF)
    }
}
