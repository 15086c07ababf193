//! Wall clock and peer timestamp consensus.
//!
//! Every inbound timestamp is a vote. Once enough plausible votes agree on a time ahead of ours,
//! the clock jumps forward to their median. It never moves backward this way.

use std::time::Instant;

/// Earliest timestamp accepted from a peer or an operator.
pub const CLOCK_FLOOR: u32 = 1_600_000_000;
/// Latest timestamp accepted (2100-01-01).
pub const CLOCK_CEILING: u32 = 4_102_444_800;
/// Samples further behind our clock than this come from a sender with a stale clock.
pub const STALE_SENDER_SECS: u32 = 3600;
/// A median must lead our clock by more than this to move it.
pub const CLOCK_SLACK_SECS: u32 = 10;
pub const CLOCK_WINDOW: usize = 5;
pub const MIN_CONSENSUS_SAMPLES: usize = 3;

/// Seconds-resolution wall clock.
pub trait RtcClock {
    fn current_time(&self) -> u32;
    fn set_current_time(&mut self, time: u32);
}

/// Clock that runs from a base epoch on the monotonic timer. Lost on restart.
#[derive(Debug, Clone)]
pub struct VolatileRtcClock {
    base: u32,
    since: Instant,
}

impl VolatileRtcClock {
    pub fn new(initial: u32) -> Self {
        Self {
            base: initial,
            since: Instant::now(),
        }
    }
}

impl RtcClock for VolatileRtcClock {
    fn current_time(&self) -> u32 {
        let elapsed = u32::try_from(self.since.elapsed().as_secs()).unwrap_or(u32::MAX);
        self.base.saturating_add(elapsed)
    }

    fn set_current_time(&mut self, time: u32) {
        self.base = time;
        self.since = Instant::now();
    }
}

/// Last few accepted peer timestamps.
#[derive(Debug, Clone, Default)]
pub struct ClockSampleWindow {
    samples: [u32; CLOCK_WINDOW],
    cursor: usize,
    len: usize,
}

impl ClockSampleWindow {
    pub fn push(&mut self, timestamp: u32) {
        self.samples[self.cursor] = timestamp;
        self.cursor = (self.cursor + 1) % CLOCK_WINDOW;
        self.len = (self.len + 1).min(CLOCK_WINDOW);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.cursor = 0;
        self.len = 0;
    }

    /// Upper median of the held samples.
    pub fn median(&self) -> Option<u32> {
        if self.len == 0 {
            return None;
        }
        let mut sorted = self.samples;
        let held = &mut sorted[..self.len];
        held.sort_unstable();
        Some(held[self.len / 2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSyncOutcome {
    /// Implausible or stale; not counted.
    Rejected,
    Sampled,
    Adjusted { from: u32, to: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    window: ClockSampleWindow,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self) -> &ClockSampleWindow {
        &self.window
    }

    /// Feed one sender-supplied timestamp.
    pub fn observe(&mut self, timestamp: u32, clock: &mut impl RtcClock) -> ClockSyncOutcome {
        let now = clock.current_time();
        if !(CLOCK_FLOOR..=CLOCK_CEILING).contains(&timestamp)
            || timestamp.saturating_add(STALE_SENDER_SECS) < now
        {
            return ClockSyncOutcome::Rejected;
        }

        self.window.push(timestamp);
        if self.window.len() < MIN_CONSENSUS_SAMPLES {
            return ClockSyncOutcome::Sampled;
        }
        let Some(median) = self.window.median() else {
            return ClockSyncOutcome::Sampled;
        };
        if median > now.saturating_add(CLOCK_SLACK_SECS) {
            clock.set_current_time(median);
            self.window.clear();
            tracing::info!(from = now, to = median, "clock advanced to peer consensus");
            return ClockSyncOutcome::Adjusted { from: now, to: median };
        }
        ClockSyncOutcome::Sampled
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("timestamp {0} is beyond the supported range")]
    TooFarInFuture(u32),
    #[error("timestamp {0} is before the supported range")]
    TooOld(u32),
    #[error("timestamp {requested} is not after the current time {current}")]
    NotLater { requested: u32, current: u32 },
}

/// Operator clock set. Only moves the clock forward.
pub fn set_clock_manually(clock: &mut impl RtcClock, timestamp: u32) -> Result<(), ClockError> {
    if timestamp > CLOCK_CEILING {
        return Err(ClockError::TooFarInFuture(timestamp));
    }
    if timestamp < CLOCK_FLOOR {
        return Err(ClockError::TooOld(timestamp));
    }
    let current = clock.current_time();
    if timestamp <= current {
        return Err(ClockError::NotLater {
            requested: timestamp,
            current,
        });
    }
    clock.set_current_time(timestamp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;

    const T: u32 = 1_700_000_000;

    fn feed(local: u32, samples: &[u32]) -> (ManualClock, Vec<ClockSyncOutcome>) {
        let mut clock = ManualClock::at(local);
        let mut sync = ClockSync::new();
        let outcomes = samples.iter().map(|&s| sync.observe(s, &mut clock)).collect();
        (clock, outcomes)
    }

    #[test]
    fn median_ignores_single_outlier() {
        let mut w = ClockSampleWindow::default();
        for s in [T, T, T + 5, T + 5000, T + 6] {
            w.push(s);
        }
        assert_eq!(w.median(), Some(T + 5));
    }

    #[test]
    fn window_overwrites_oldest() {
        let mut w = ClockSampleWindow::default();
        for s in [1, 2, 3, 4, 5, 100, 100, 100] {
            w.push(s);
        }
        assert_eq!(w.len(), CLOCK_WINDOW);
        assert_eq!(w.median(), Some(100));
    }

    #[test]
    fn needs_three_samples() {
        let (clock, outcomes) = feed(T - 50, &[T, T]);
        assert_eq!(clock.now, T - 50);
        assert_eq!(outcomes, vec![ClockSyncOutcome::Sampled; 2]);
    }

    #[test]
    fn consensus_advances_and_resets() {
        let (clock, outcomes) = feed(T - 50, &[T, T, T + 5, T + 5000, T + 6]);
        assert_eq!(outcomes[2], ClockSyncOutcome::Adjusted { from: T - 50, to: T });
        // Window was cleared: two more samples are not enough for another jump.
        assert_eq!(clock.now, T);
    }

    #[test]
    fn outlier_never_sets_clock_directly() {
        let (clock, _) = feed(T - 6, &[T, T, T + 5000]);
        // Median of [T, T, T+5000] is T, within slack of T-6.
        assert_eq!(clock.now, T - 6);
        let (clock, outcomes) = feed(T - 6, &[T, T, T + 5, T + 5000]);
        assert_eq!(outcomes[3], ClockSyncOutcome::Adjusted { from: T - 6, to: T + 5 });
        assert_eq!(clock.now, T + 5);
    }

    #[test]
    fn within_slack_never_moves() {
        let (clock, outcomes) = feed(T - 5, &[T, T, T + 5, T + 5000, T + 6]);
        assert_eq!(clock.now, T - 5);
        assert!(outcomes.iter().all(|o| *o == ClockSyncOutcome::Sampled));
    }

    #[test]
    fn implausible_and_stale_rejected() {
        let (clock, outcomes) = feed(T, &[CLOCK_FLOOR - 1, CLOCK_CEILING + 1, T - 3601]);
        assert_eq!(outcomes, vec![ClockSyncOutcome::Rejected; 3]);
        assert_eq!(clock.now, T);
        let (_, outcomes) = feed(T, &[T - 3600]);
        assert_eq!(outcomes, vec![ClockSyncOutcome::Sampled]);
    }

    #[test]
    fn never_moves_backward() {
        let (clock, _) = feed(T, &[T - 100, T - 100, T - 100, T - 100]);
        assert_eq!(clock.now, T);
    }

    #[test]
    fn manual_set_rules() {
        let mut clock = ManualClock::at(T);
        assert_eq!(
            set_clock_manually(&mut clock, CLOCK_CEILING + 1),
            Err(ClockError::TooFarInFuture(CLOCK_CEILING + 1))
        );
        assert_eq!(set_clock_manually(&mut clock, 1000), Err(ClockError::TooOld(1000)));
        assert_eq!(
            set_clock_manually(&mut clock, T),
            Err(ClockError::NotLater { requested: T, current: T })
        );
        set_clock_manually(&mut clock, T + 60).unwrap();
        assert_eq!(clock.now, T + 60);
    }

    #[test]
    fn volatile_clock_tracks_base() {
        let mut clock = VolatileRtcClock::new(T);
        assert!(clock.current_time() >= T);
        clock.set_current_time(T + 1000);
        assert!(clock.current_time() >= T + 1000);
    }
}
