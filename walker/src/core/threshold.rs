//! Adaptive planning threshold for signal-driven pre-emptive planning.
//!
//! The driver plans early when closed-issue context accumulates faster than
//! the planner can absorb it. The byte threshold self-tunes: an unproductive
//! planning round raises the bar, a productive one lowers it, always clamped
//! to a sane band.

use chrono::{DateTime, Utc};

use crate::core::types::CloseSignal;

pub const DEFAULT_THRESHOLD_BYTES: u64 = 15_000;
pub const MIN_THRESHOLD_BYTES: u64 = 5_000;
pub const MAX_THRESHOLD_BYTES: u64 = 50_000;

/// New closed-issue context observed since the last planning round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewContext {
    pub bytes: u64,
    pub signals: Vec<CloseSignal>,
    pub issues: Vec<String>,
}

impl NewContext {
    pub fn has_signal(&self, signal: CloseSignal) -> bool {
        self.signals.contains(&signal)
    }
}

/// Mutable planning-threshold state owned by the driver loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningThreshold {
    bytes: u64,
    pub last_planning_time: DateTime<Utc>,
}

impl PlanningThreshold {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            bytes: DEFAULT_THRESHOLD_BYTES,
            last_planning_time: now,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Plan pre-emptively on any pivotal closure, or on a surprising closure
    /// once enough new context has accumulated.
    pub fn should_plan_now(&self, context: &NewContext) -> bool {
        if context.has_signal(CloseSignal::Pivotal) {
            return true;
        }
        context.bytes > self.bytes && context.has_signal(CloseSignal::Surprising)
    }

    /// Record a completed planning round and adapt the threshold from how
    /// many new ready issues the planner produced.
    pub fn observe_round(&mut self, created: usize, now: DateTime<Utc>) {
        let scaled = if created <= 1 {
            (self.bytes as f64 * 1.5) as u64
        } else if created >= 3 {
            (self.bytes as f64 * 0.75) as u64
        } else {
            self.bytes
        };
        self.bytes = scaled.clamp(MIN_THRESHOLD_BYTES, MAX_THRESHOLD_BYTES);
        self.last_planning_time = now;
    }
}
