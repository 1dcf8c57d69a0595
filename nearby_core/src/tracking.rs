//! Tracked peer table - the engine's authoritative per-peer state.
//!
//! A [`TrackedPeer`] is created on the first accepted report for an id and
//! updated in place on every later accepted report. Removal is two-phase:
//! [`PeerTable::mark_removed`] hides the peer from clustering, and the entry
//! is only deleted once its marker finished disappearing.

use nearby_env::{PeerId, PeerReport, Position, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ranking::{ProximityBucket, ProximityRecord};

/// Per-peer state owned by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPeer {
    /// Latest accepted report
    pub report: PeerReport,

    /// Ranking derived from `report` and the viewer position
    pub proximity: ProximityRecord,

    /// When `report` was accepted (engine clock)
    pub last_accepted_at: Timestamp,

    /// Where the peer was last drawn (own marker or enclosing cluster)
    pub rendered_position: Option<Position>,

    /// Removal requested; waiting for the disappearance to finish
    pub removed: bool,
}

impl TrackedPeer {
    pub fn new(report: PeerReport, proximity: ProximityRecord, accepted_at: Timestamp) -> Self {
        Self {
            report,
            proximity,
            last_accepted_at: accepted_at,
            rendered_position: None,
            removed: false,
        }
    }

    #[inline]
    pub fn id(&self) -> PeerId {
        self.report.id
    }

    #[inline]
    pub fn position(&self) -> Option<Position> {
        self.report.position
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.report.online
    }
}

/// Histogram of tracked peers by proximity bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub very_close: usize,
    pub nearby: usize,
    pub in_town: usize,
    pub unknown: usize,
}

/// The table of tracked peers.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, TrackedPeer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an accepted report, creating the entry if needed.
    ///
    /// A report for a peer pending removal revives it.
    pub fn upsert(&mut self, report: PeerReport, proximity: ProximityRecord, now: Timestamp) {
        match self.peers.get_mut(&report.id) {
            Some(peer) => {
                peer.report = report;
                peer.proximity = proximity;
                peer.last_accepted_at = now;
                peer.removed = false;
            }
            None => {
                self.peers
                    .insert(report.id, TrackedPeer::new(report, proximity, now));
            }
        }
    }

    /// Flags a peer for removal. Returns false if it is not tracked.
    pub fn mark_removed(&mut self, id: &PeerId) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.removed = true;
                true
            }
            None => false,
        }
    }

    /// Deletes a peer outright.
    pub fn remove(&mut self, id: &PeerId) -> Option<TrackedPeer> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&TrackedPeer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut TrackedPeer> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// All tracked peers, including those pending removal.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedPeer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedPeer> {
        self.peers.values_mut()
    }

    /// Peers that should be on the map.
    pub fn live(&self) -> impl Iterator<Item = &TrackedPeer> {
        self.peers.values().filter(|peer| !peer.removed)
    }

    /// Ids of peers pending removal.
    pub fn removed_ids(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| peer.removed)
            .map(TrackedPeer::id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Live peers sorted for the nearby list: best priority first.
    pub fn ranked(&self) -> Vec<&TrackedPeer> {
        let mut ranked: Vec<&TrackedPeer> = self.live().collect();
        ranked.sort_by(|a, b| {
            a.proximity
                .rank_cmp(&b.proximity)
                .then_with(|| a.id().cmp(&b.id()))
        });
        ranked
    }

    /// Bucket histogram over live peers.
    pub fn bucket_counts(&self) -> BucketCounts {
        let mut counts = BucketCounts::default();
        for peer in self.live() {
            match peer.proximity.bucket {
                Some(ProximityBucket::VeryClose) => counts.very_close += 1,
                Some(ProximityBucket::Nearby) => counts.nearby += 1,
                Some(ProximityBucket::InTown) => counts.in_town += 1,
                None => counts.unknown += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(score: f64, distance: Option<f64>, bucket: Option<ProximityBucket>) -> ProximityRecord {
        ProximityRecord {
            distance_m: distance,
            bucket,
            priority_score: score,
        }
    }

    fn report(seed: u64) -> PeerReport {
        PeerReport::new(PeerId::from_seed(seed), Position::new(0.0, 0.0), 0)
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let mut table = PeerTable::new();
        table.upsert(report(1), ProximityRecord::unknown(), 10);
        assert_eq!(table.len(), 1);

        let mut moved = report(1);
        moved.position = Some(Position::new(1.0, 1.0));
        table.upsert(moved, ProximityRecord::unknown(), 20);

        let peer = table.get(&PeerId::from_seed(1)).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(peer.last_accepted_at, 20);
        assert_eq!(peer.position(), Some(Position::new(1.0, 1.0)));
    }

    #[test]
    fn test_mark_removed_hides_from_live() {
        let mut table = PeerTable::new();
        table.upsert(report(1), ProximityRecord::unknown(), 0);
        table.upsert(report(2), ProximityRecord::unknown(), 0);

        assert!(table.mark_removed(&PeerId::from_seed(1)));
        assert!(!table.mark_removed(&PeerId::from_seed(99)));

        assert_eq!(table.len(), 2);
        assert_eq!(table.live().count(), 1);
        assert_eq!(table.removed_ids(), vec![PeerId::from_seed(1)]);
    }

    #[test]
    fn test_report_revives_removed_peer() {
        let mut table = PeerTable::new();
        table.upsert(report(1), ProximityRecord::unknown(), 0);
        table.mark_removed(&PeerId::from_seed(1));
        table.upsert(report(1), ProximityRecord::unknown(), 5);
        assert!(!table.get(&PeerId::from_seed(1)).unwrap().removed);
    }

    #[test]
    fn test_ranked_order_and_buckets() {
        let mut table = PeerTable::new();
        table.upsert(report(1), record(0.6, Some(2_500.0), Some(ProximityBucket::InTown)), 0);
        table.upsert(report(2), record(0.1, Some(100.0), Some(ProximityBucket::VeryClose)), 0);
        table.upsert(report(3), ProximityRecord::unknown(), 0);
        table.upsert(report(4), record(0.3, Some(900.0), Some(ProximityBucket::Nearby)), 0);

        let order: Vec<PeerId> = table.ranked().iter().map(|p| p.id()).collect();
        assert_eq!(
            order,
            vec![
                PeerId::from_seed(2),
                PeerId::from_seed(4),
                PeerId::from_seed(1),
                PeerId::from_seed(3)
            ]
        );

        assert_eq!(
            table.bucket_counts(),
            BucketCounts {
                very_close: 1,
                nearby: 1,
                in_town: 1,
                unknown: 1
            }
        );
    }
}
