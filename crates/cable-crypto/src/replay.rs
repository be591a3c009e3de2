//! Replay protection.
//!
//! Every frame carries its sender's counter on the wire, and the receiver
//! tracks which counters it has accepted in a sliding window bitmap anchored
//! at the highest counter seen. A counter is accepted iff it is above
//! `highest − REPLAY_WINDOW` and has not been seen before; anything else is a
//! replay or too old. The sender side is a plain monotonic counter that
//! refuses to wrap.

/// Size of the sliding window in frames.
pub const REPLAY_WINDOW: u64 = 128;

const WORDS: usize = (REPLAY_WINDOW / 64) as usize;

/// Error type for replay detection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("duplicate frame counter {counter}")]
    Duplicate { counter: u64 },
    #[error("frame counter {counter} is behind the replay window (start {window_start})")]
    TooOld { counter: u64, window_start: u64 },
}

/// Sliding-window replay filter over received frame counters.
///
/// Bit `k` of the bitmap (counting from word 0, bit 0) marks counter
/// `highest − k` as seen. Window memory is fixed: 128 bits.
#[derive(Debug, Default)]
pub struct ReplayFilter {
    highest: u64,
    seen: [u64; WORDS],
    primed: bool,
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Would `counter` be accepted right now? Does not modify the window.
    ///
    /// Used to pre-screen a frame before paying for authentication; the
    /// window itself is only committed via [`check_and_update`] once the
    /// frame's tag has verified, so forged counters never poison it.
    ///
    /// [`check_and_update`]: ReplayFilter::check_and_update
    pub fn peek(&self, counter: u64) -> Result<(), ReplayError> {
        if !self.primed || counter > self.highest {
            return Ok(());
        }
        let offset = self.highest - counter;
        if offset >= REPLAY_WINDOW {
            return Err(ReplayError::TooOld {
                counter,
                window_start: self.window_start(),
            });
        }
        if self.is_seen(offset) {
            return Err(ReplayError::Duplicate { counter });
        }
        Ok(())
    }

    /// Accept `counter`, updating the window. Same acceptance rule as
    /// [`peek`](ReplayFilter::peek).
    pub fn check_and_update(&mut self, counter: u64) -> Result<(), ReplayError> {
        self.peek(counter)?;
        if !self.primed {
            self.primed = true;
            self.highest = counter;
            self.seen = [1, 0];
            return Ok(());
        }
        if counter > self.highest {
            self.slide_forward(counter - self.highest);
            self.highest = counter;
            self.seen[0] |= 1;
            return Ok(());
        }
        let offset = self.highest - counter;
        self.seen[(offset / 64) as usize] |= 1u64 << (offset % 64);
        Ok(())
    }

    /// Highest counter accepted so far (0 before the first frame).
    pub fn highest(&self) -> u64 {
        self.highest
    }

    fn window_start(&self) -> u64 {
        self.highest.saturating_sub(REPLAY_WINDOW - 1)
    }

    fn is_seen(&self, offset: u64) -> bool {
        self.seen[(offset / 64) as usize] & (1u64 << (offset % 64)) != 0
    }

    /// Advance the window: every recorded offset grows by `shift`.
    fn slide_forward(&mut self, shift: u64) {
        if shift >= REPLAY_WINDOW {
            self.seen = [0; WORDS];
            return;
        }
        let s = shift as u32;
        if s >= 64 {
            self.seen[1] = self.seen[0] << (s - 64);
            self.seen[0] = 0;
        } else {
            self.seen[1] = (self.seen[1] << s) | (self.seen[0] >> (64 - s));
            self.seen[0] <<= s;
        }
    }
}

/// Outbound frame counter. Strictly monotonic; never wraps.
#[derive(Debug, Default)]
pub struct FrameCounter(u64);

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume counting from `value`. Used by tests to exercise exhaustion.
    pub fn starting_at(value: u64) -> Self {
        Self(value)
    }

    /// Claim the next counter value, or `None` once the space is exhausted.
    pub fn next(&mut self) -> Option<u64> {
        if self.0 == u64::MAX {
            return None;
        }
        let value = self.0;
        self.0 += 1;
        Some(value)
    }

    /// The value the next [`next`](FrameCounter::next) call would return.
    pub fn current(&self) -> u64 {
        self.0
    }
}
