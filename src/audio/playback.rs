//! # Playback Scheduler
//!
//! Assistant speech arrives as a sequence of short PCM buffers with variable
//! network jitter. The scheduler keeps one cursor, the earliest time the next
//! buffer may start, and places each buffer so that playback is gapless and
//! never overlaps.
//!
//! When a buffer arrives after the cursor has already elapsed the cursor is
//! moved to "now": an underrun is accepted instead of stacking a backlog.
//!
//! Times are seconds on the session's media clock.

/// Where a decoded buffer should be played.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledPlayback {
    #[cfg(test)]
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    cursor: f64,
    scheduled: u64,
    underruns: u64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a buffer of `duration` seconds that arrived at `now`.
    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledPlayback {
        if self.cursor < now {
            if self.scheduled > 0 {
                self.underruns += 1;
            }
            self.cursor = now;
        }

        let start_at = self.cursor;
        let duration = duration.max(0.0);
        self.cursor = start_at + duration;
        self.scheduled += 1;

        ScheduledPlayback { start_at, duration }
    }

    /// Forget queued audio at `now`, e.g. after the user barges in. The
    /// next buffer starts immediately and is not counted as an underrun.
    pub fn reset(&mut self, now: f64) {
        self.cursor = now;
        self.scheduled = 0;
    }

    #[cfg(test)]
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Buffers that arrived after the previous one had finished playing.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}
