//! # Fixed-Rate Tick Loop
//!
//! Wall-clock cadence for one loop (simulation or network).
//!
//! ## Design
//!
//! - A tick is due when the clock passes `next_due`
//! - A late tick never triggers a burst of catch-up ticks: every missed
//!   deadline is skipped and counted instead
//! - A tick whose work outlives its budget is an overrun; the loop does not
//!   wait before the next one

use std::time::{Duration, Instant};

/// Result of polling the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickPoll {
    /// Not yet. Holds the time left until the next tick.
    NotDue(Duration),
    /// Run a tick now. `skipped` deadlines were dropped to get back on cadence.
    Due {
        /// Deadlines missed since the previous tick.
        skipped: u64,
    },
}

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickStats {
    /// Minimum tick duration observed.
    pub min_tick_us: u64,
    /// Maximum tick duration observed.
    pub max_tick_us: u64,
    /// Average tick duration (rolling).
    pub avg_tick_us: u64,
    /// Ticks that took longer than their budget.
    pub overruns: u64,
    /// Deadlines skipped to correct drift.
    pub skipped_ticks: u64,
    /// Total ticks measured.
    pub total_ticks: u64,
}

impl TickStats {
    fn fresh(budget: Duration) -> Self {
        Self {
            min_tick_us: u64::MAX,
            max_tick_us: 0,
            avg_tick_us: budget.as_micros() as u64,
            overruns: 0,
            skipped_ticks: 0,
            total_ticks: 0,
        }
    }
}

/// Fixed-timestep tick loop controller.
pub struct TickLoop {
    /// Target tick duration.
    tick_duration: Duration,
    /// Deadline of the next tick.
    next_due: Instant,
    /// Total ticks started.
    tick_count: u64,
    stats: TickStats,
}

impl TickLoop {
    /// Creates a loop ticking every `tick_duration` whose first tick is due
    /// at `start`.
    #[must_use]
    pub fn starting_at(tick_duration: Duration, start: Instant) -> Self {
        Self {
            tick_duration,
            next_due: start,
            tick_count: 0,
            stats: TickStats::fresh(tick_duration),
        }
    }

    /// Checks whether a tick is due at `now`.
    ///
    /// A `Due` result starts the tick: the deadline moves past `now`, and any
    /// deadlines missed along the way are skipped.
    pub fn poll(&mut self, now: Instant) -> TickPoll {
        if now < self.next_due {
            return TickPoll::NotDue(self.next_due - now);
        }

        let late = now.duration_since(self.next_due);
        let skipped = (late.as_nanos() / self.tick_duration.as_nanos().max(1)) as u64;
        self.next_due += self.tick_duration * (skipped as u32 + 1);
        self.tick_count += 1;

        if skipped > 0 {
            self.stats.skipped_ticks += skipped;
            tracing::warn!(skipped, tick = self.tick_count, "tick loop fell behind, skipping missed ticks");
        }
        TickPoll::Due { skipped }
    }

    /// Records the duration of a finished tick. Returns true on overrun.
    pub fn end_tick(&mut self, start: Instant) -> bool {
        let duration = start.elapsed();
        let duration_us = duration.as_micros() as u64;

        self.stats.total_ticks += 1;
        self.stats.min_tick_us = self.stats.min_tick_us.min(duration_us);
        self.stats.max_tick_us = self.stats.max_tick_us.max(duration_us);
        self.stats.avg_tick_us = (self.stats.avg_tick_us * 15 + duration_us) / 16;

        let overrun = duration > self.tick_duration;
        if overrun {
            self.stats.overruns += 1;
        }
        overrun
    }

    /// Deadline of the next tick.
    #[inline]
    #[must_use]
    pub const fn next_due(&self) -> Instant {
        self.next_due
    }

    /// Returns the number of ticks started.
    #[inline]
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns tick statistics.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Returns the target tick duration.
    #[inline]
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    fn every_ms(ms: u64, start: Instant) -> TickLoop {
        TickLoop::starting_at(Duration::from_millis(ms), start)
    }

    #[test]
    fn test_tick_loop_creation() {
        let config = SimConfig::default();
        let simulation = TickLoop::starting_at(config.simulation_tick(), Instant::now());
        let network = TickLoop::starting_at(config.network_tick(), Instant::now());
        assert_eq!(simulation.tick_count(), 0);
        assert_eq!(simulation.tick_duration(), Duration::from_micros(16666));
        assert_eq!(network.tick_duration(), Duration::from_micros(33333));
    }

    #[test]
    fn test_cadence_without_drift() {
        let start = Instant::now();
        let mut tick_loop = every_ms(10, start);
        let step = Duration::from_millis(10);

        assert_eq!(tick_loop.poll(start), TickPoll::Due { skipped: 0 });
        assert_eq!(tick_loop.poll(start + Duration::from_millis(4)), TickPoll::NotDue(Duration::from_millis(6)));
        assert_eq!(tick_loop.poll(start + step), TickPoll::Due { skipped: 0 });
        assert_eq!(tick_loop.next_due(), start + step * 2);
        assert_eq!(tick_loop.tick_count(), 2);
    }

    #[test]
    fn test_late_poll_skips_missed_ticks() {
        let start = Instant::now();
        let mut tick_loop = every_ms(10, start);
        let step = Duration::from_millis(10);
        let _ = tick_loop.poll(start);

        // Due at 10ms, polled at 45ms: deadlines 20, 30 and 40 were missed.
        assert_eq!(tick_loop.poll(start + Duration::from_millis(45)), TickPoll::Due { skipped: 3 });
        assert_eq!(tick_loop.next_due(), start + step * 5);
        assert_eq!(tick_loop.stats().skipped_ticks, 3);
        assert!(matches!(tick_loop.poll(start + Duration::from_millis(46)), TickPoll::NotDue(_)));
    }

    #[test]
    fn test_overrun_is_counted() {
        let mut tick_loop = every_ms(1, Instant::now());
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(3));
        assert!(tick_loop.end_tick(start));
        assert!(!tick_loop.end_tick(Instant::now()));

        let stats = tick_loop.stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.total_ticks, 2);
        assert!(stats.min_tick_us <= stats.max_tick_us);
    }
}
