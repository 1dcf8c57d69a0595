//! Update Throttle - significance gate for incoming peer reports.
//!
//! A report is let through when it is the first one for a peer, when the
//! peer moved further than `movement_epsilon_m`, when more than
//! `min_interval_ms` passed since the last accepted update, or when the
//! online/moving flags flipped. Everything else is dropped before it can
//! reach ranking, clustering or the lifecycle manager.

use nearby_env::{PeerId, PeerReport, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ranking::haversine_distance;

/// Thresholds for the throttle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum movement that counts as significant (default: 5 m)
    pub movement_epsilon_m: f64,

    /// Minimum time between accepted updates for a stationary peer (default: 150 ms)
    pub min_interval_ms: i64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            movement_epsilon_m: 5.0,
            min_interval_ms: 150,
        }
    }
}

/// Last report let through for a peer, and when.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedSample {
    pub report: PeerReport,
    pub accepted_at: Timestamp,
}

/// Outcome of evaluating one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// No previous sample for this peer
    First,
    /// Moved beyond the epsilon (or gained/lost a position)
    Moved,
    /// The interval elapsed
    IntervalElapsed,
    /// Online or moving flag changed
    StatusChanged,
    /// Not significant
    Rejected,
}

impl ThrottleDecision {
    pub fn is_accepted(self) -> bool {
        !matches!(self, ThrottleDecision::Rejected)
    }
}

/// Per-peer throttle. The only state is the last accepted sample per id.
#[derive(Debug, Default)]
pub struct UpdateThrottle {
    config: ThrottleConfig,
    last_accepted: HashMap<PeerId, AcceptedSample>,
}

impl UpdateThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            last_accepted: HashMap::new(),
        }
    }

    /// Decides whether `report` is significant relative to `previous`.
    pub fn evaluate(
        &self,
        report: &PeerReport,
        previous: Option<&AcceptedSample>,
        now: Timestamp,
    ) -> ThrottleDecision {
        let previous = match previous {
            Some(previous) => previous,
            None => return ThrottleDecision::First,
        };
        let last = &previous.report;

        let moved = match (&last.position, &report.position) {
            (Some(a), Some(b)) => haversine_distance(a, b) > self.config.movement_epsilon_m,
            (None, None) => false,
            _ => true,
        };
        if moved {
            return ThrottleDecision::Moved;
        }

        if last.online != report.online || last.moving != report.moving {
            return ThrottleDecision::StatusChanged;
        }

        if now.saturating_sub(previous.accepted_at) > self.config.min_interval_ms {
            return ThrottleDecision::IntervalElapsed;
        }

        ThrottleDecision::Rejected
    }

    /// Evaluates `report` against the stored sample and records it when accepted.
    pub fn accept(&mut self, report: &PeerReport, now: Timestamp) -> ThrottleDecision {
        let decision = self.evaluate(report, self.last_accepted.get(&report.id), now);
        if decision.is_accepted() {
            self.last_accepted.insert(
                report.id,
                AcceptedSample {
                    report: report.clone(),
                    accepted_at: now,
                },
            );
        }
        decision
    }

    /// Last accepted sample for a peer.
    pub fn last_accepted(&self, id: &PeerId) -> Option<&AcceptedSample> {
        self.last_accepted.get(id)
    }

    /// Drops the state for one peer; its next report counts as first.
    pub fn forget(&mut self, id: &PeerId) {
        self.last_accepted.remove(id);
    }

    /// Drops all state.
    pub fn reset(&mut self) {
        self.last_accepted.clear();
    }

    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }
}
