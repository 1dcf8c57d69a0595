//! The "RANKING" Engine - Distance & Priority Calculator
//!
//! Turns a peer report plus the viewer's own position into a
//! [`ProximityRecord`]: great-circle distance, a coarse proximity bucket and
//! a composite priority score (lower = shown first).
//!
//! ```text
//! score = w_p · min(d / D, 1) + w_r · min(Δt / T, 1) + w_s · (online ? 0 : 1)
//! ```
//!
//! The weights and horizons are empirical tuning values and live in
//! [`RankingConfig`].

use geo::{HaversineDistance, Point};
use nearby_env::{PeerReport, Position, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::validation::{validate_position, validate_report, ValidationError};

/// Score given to peers whose distance cannot be computed.
pub const WORST_PRIORITY: f64 = f64::MAX;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Weights and horizons for the priority score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Weight of the normalized distance term (default: 0.5)
    pub proximity_weight: f64,

    /// Weight of the normalized staleness term (default: 0.3)
    pub recency_weight: f64,

    /// Weight of the offline penalty (default: 0.2)
    pub status_weight: f64,

    /// Distance at which the proximity term saturates (default: 10 km)
    pub proximity_horizon_m: f64,

    /// Staleness at which the recency term saturates (default: 24 h)
    pub recency_horizon_ms: i64,

    /// Upper edge of the VERY_CLOSE bucket (default: 300 m)
    pub very_close_m: f64,

    /// Upper edge of the NEARBY bucket (default: 2 km)
    pub nearby_m: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            proximity_weight: 0.5,
            recency_weight: 0.3,
            status_weight: 0.2,
            proximity_horizon_m: 10_000.0,
            recency_horizon_ms: 86_400_000,
            very_close_m: 300.0,
            nearby_m: 2_000.0,
        }
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Coarse distance classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProximityBucket {
    VeryClose,
    Nearby,
    InTown,
}

/// Derived ranking data for one peer. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityRecord {
    /// Great-circle distance in meters; `None` when either side has no position
    pub distance_m: Option<f64>,

    /// Bucket for `distance_m`; `None` when the distance is unknown
    pub bucket: Option<ProximityBucket>,

    /// Composite score, lower = higher priority
    pub priority_score: f64,
}

impl ProximityRecord {
    /// Record for a peer that cannot be placed relative to the viewer.
    pub fn unknown() -> Self {
        Self {
            distance_m: None,
            bucket: None,
            priority_score: WORST_PRIORITY,
        }
    }

    /// Total order used by the nearby list: score, then distance (unknown last).
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        self.priority_score
            .total_cmp(&other.priority_score)
            .then_with(|| match (self.distance_m, other.distance_m) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    }
}

// ============================================================================
// DISTANCE
// ============================================================================

/// Great-circle (haversine) distance in meters between two WGS84 positions.
#[inline]
pub fn haversine_distance(a: &Position, b: &Position) -> f64 {
    // geo points are (x = lng, y = lat)
    Point::new(a.lng, a.lat).haversine_distance(&Point::new(b.lng, b.lat))
}

// ============================================================================
// CALCULATOR
// ============================================================================

/// Stateless scorer; holds only its configuration.
#[derive(Debug, Clone, Default)]
pub struct ProximityCalculator {
    config: RankingConfig,
}

impl ProximityCalculator {
    pub fn new(config: RankingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Classifies a distance into a bucket.
    pub fn bucket_for(&self, distance_m: f64) -> ProximityBucket {
        if distance_m < self.config.very_close_m {
            ProximityBucket::VeryClose
        } else if distance_m < self.config.nearby_m {
            ProximityBucket::Nearby
        } else {
            ProximityBucket::InTown
        }
    }

    /// Scores one report against the viewer.
    ///
    /// Malformed coordinates on either side are rejected instead of being
    /// allowed to produce a NaN score.
    pub fn score(
        &self,
        viewer: Option<&Position>,
        report: &PeerReport,
        now: Timestamp,
    ) -> Result<ProximityRecord, ValidationError> {
        validate_report(report)?;
        if let Some(viewer) = viewer {
            validate_position(viewer)?;
        }

        let (viewer, peer) = match (viewer, report.position.as_ref()) {
            (Some(viewer), Some(peer)) => (viewer, peer),
            _ => return Ok(ProximityRecord::unknown()),
        };

        let distance_m = haversine_distance(viewer, peer);
        let cfg = &self.config;

        let proximity = (distance_m / cfg.proximity_horizon_m).min(1.0);
        // Clock skew can put last_seen in the future
        let age_ms = now.saturating_sub(report.last_seen).max(0);
        let recency = (age_ms as f64 / cfg.recency_horizon_ms.max(1) as f64).min(1.0);
        let status = if report.online { 0.0 } else { 1.0 };

        let priority_score = cfg.proximity_weight * proximity
            + cfg.recency_weight * recency
            + cfg.status_weight * status;

        Ok(ProximityRecord {
            distance_m: Some(distance_m),
            bucket: Some(self.bucket_for(distance_m)),
            priority_score,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
