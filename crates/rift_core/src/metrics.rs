//! # Runtime Metrics
//!
//! Counters kept by the simulation. A copy is published after every tick to
//! a shared lock so monitoring can read it without touching the loop.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::dimension::DimensionState;
use crate::events::SimEvent;

/// Shared, always-readable metrics snapshot.
pub type SharedMetrics = Arc<RwLock<SimMetrics>>;

/// Simulation counters. All values are totals since start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimMetrics {
    /// Simulation ticks run.
    pub ticks: u64,
    /// Deadlines skipped to correct drift.
    pub skipped_ticks: u64,
    /// Ticks that exceeded their budget.
    pub overruns: u64,
    /// Entity effect-timer updates carried to a later tick.
    pub deferred_effect_updates: u64,
    /// Migrations left queued at the end of a tick.
    pub deferred_migrations: u64,
    /// Entities migrated.
    pub migrations: u64,
    /// Invocations committed.
    pub resolutions: u64,
    /// Invocations refused.
    pub rejections: u64,
    /// Invocations cancelled before dispatch.
    pub cancellations: u64,
    /// Effect applications that landed.
    pub effects_applied: u64,
    /// Effect instances that ended.
    pub effects_expired: u64,
    /// Effect applications dropped without error.
    pub effects_dropped: u64,
    /// Effect applications refused at the dimension ceiling.
    pub capacity_rejections: u64,
    /// Dimensions collapsed.
    pub collapses: u64,
    /// Matchmaking admissions.
    pub admissions: u64,
    /// Matchmaking timeouts.
    pub timeouts: u64,
    /// Events the outbound channel had no room for.
    pub dropped_events: u64,
    /// Network deltas handed to the broadcast sink.
    pub deltas_broadcast: u64,
    /// Longest tick observed, in microseconds.
    pub max_tick_us: u64,
}

impl SimMetrics {
    /// Records the wall-clock cost of one tick.
    #[inline]
    pub fn record_tick_duration(&mut self, duration: Duration) {
        self.max_tick_us = self.max_tick_us.max(duration.as_micros() as u64);
    }

    /// Counts one published event.
    pub fn observe(&mut self, event: &SimEvent) {
        match event {
            SimEvent::AbilityResolved { .. } => self.resolutions += 1,
            SimEvent::AbilityRejected { .. } => self.rejections += 1,
            SimEvent::EffectApplied { .. } => self.effects_applied += 1,
            SimEvent::EffectExpired { .. } => self.effects_expired += 1,
            SimEvent::EffectDropped { .. } => self.effects_dropped += 1,
            SimEvent::EffectCapacityExceeded { .. } => self.capacity_rejections += 1,
            SimEvent::DimensionStateChanged { to: DimensionState::Collapsed, .. } => self.collapses += 1,
            SimEvent::EntityMigrated { .. } => self.migrations += 1,
            SimEvent::MatchmakingAdmitted { .. } => self.admissions += 1,
            SimEvent::MatchmakingTimedOut { .. } => self.timeouts += 1,
            SimEvent::DimensionStateChanged { .. } | SimEvent::RiftOpened { .. } | SimEvent::RiftClosed { .. } => {}
        }
    }

    /// Share of invocations that were refused.
    #[must_use]
    pub fn rejection_rate(&self) -> f64 {
        let total = self.resolutions + self.rejections;
        if total == 0 {
            return 0.0;
        }
        self.rejections as f64 / total as f64
    }

    /// Publishes a copy to the shared snapshot.
    #[inline]
    pub fn publish(&self, shared: &RwLock<Self>) {
        *shared.write() = *self;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_copies_snapshot() {
        let shared: SharedMetrics = Arc::default();
        let mut metrics = SimMetrics { ticks: 3, rejections: 1, resolutions: 3, ..SimMetrics::default() };
        metrics.record_tick_duration(Duration::from_micros(900));
        metrics.record_tick_duration(Duration::from_micros(400));
        metrics.publish(&shared);

        let seen = *shared.read();
        assert_eq!(seen.max_tick_us, 900);
        assert!((seen.rejection_rate() - 0.25).abs() < f64::EPSILON);
    }
}
