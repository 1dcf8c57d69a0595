//! Common types shared by the Nearby engine and its collaborators.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock timestamp in Unix milliseconds.
pub type Timestamp = i64;

/// Stable identifier for a tracked peer (friend), as issued by the
/// telemetry backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Creates a deterministic PeerId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of a multi-member cluster marker.
///
/// Allocated by the lifecycle manager; stable across frames for as long as
/// the cluster keeps matching by member overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identity of anything placed on the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MarkerId {
    /// A single peer rendered as a plain marker
    Peer(PeerId),
    /// A multi-member cluster rendered as a badge
    Cluster(ClusterId),
}

impl MarkerId {
    pub fn is_cluster(&self) -> bool {
        matches!(self, MarkerId::Cluster(_))
    }
}

impl std::fmt::Display for MarkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerId::Peer(id) => write!(f, "peer:{}", id),
            MarkerId::Cluster(id) => write!(f, "cluster:{}", id),
        }
    }
}

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A raw location report from the telemetry source.
///
/// Immutable once received; later reports for the same id supersede it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReport {
    /// Peer this report describes
    pub id: PeerId,

    /// Reported position; `None` when the peer shares no resolvable location
    pub position: Option<Position>,

    /// Horizontal accuracy radius in meters, if known
    pub accuracy_m: Option<f64>,

    /// Peer is currently online
    pub online: bool,

    /// Peer is currently moving
    pub moving: bool,

    /// When the peer was last seen by the telemetry source
    pub last_seen: Timestamp,
}

impl PeerReport {
    /// Creates an online, stationary report with unknown accuracy.
    pub fn new(id: PeerId, position: Position, last_seen: Timestamp) -> Self {
        Self {
            id,
            position: Some(position),
            accuracy_m: None,
            online: true,
            moving: false,
            last_seen,
        }
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn with_moving(mut self, moving: bool) -> Self {
        self.moving = moving;
        self
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_seed_is_deterministic() {
        assert_eq!(PeerId::from_seed(7), PeerId::from_seed(7));
        assert_ne!(PeerId::from_seed(7), PeerId::from_seed(8));
    }

    #[test]
    fn test_marker_id_kind() {
        assert!(MarkerId::Cluster(ClusterId(3)).is_cluster());
        assert!(!MarkerId::Peer(PeerId::from_seed(1)).is_cluster());
        assert_eq!(MarkerId::Cluster(ClusterId(3)).to_string(), "cluster:c3");
    }

    #[test]
    fn test_report_builders() {
        let report = PeerReport::new(PeerId::from_seed(1), Position::new(1.0, 2.0), 10)
            .with_online(false)
            .with_moving(true)
            .with_accuracy(12.5);
        assert!(!report.online);
        assert!(report.moving);
        assert_eq!(report.accuracy_m, Some(12.5));
    }
}
