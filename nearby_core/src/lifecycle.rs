//! Marker Lifecycle Manager - per-marker animation state and frame diffing.
//!
//! Every rendered entity (a peer marker or a cluster badge) owns a
//! [`MarkerVisualState`] that walks:
//!
//! ```text
//!   (new) ─► APPEARING ─► IDLE ◄─► MOVING
//!                           │
//!                           ▼
//!                     DISAPPEARING ─► (removed)
//! ```
//!
//! [`MarkerLifecycle::reconcile`] diffs a fresh clustering pass against the
//! previous frame and emits only the commands needed to get there.
//! [`MarkerLifecycle::tick`] settles finished animations and emits the final
//! `Remove` for markers whose disappearance completed.

use nearby_env::{
    ClusterId, MarkerId, MarkerPlacement, PeerId, Position, RenderCommand, RenderSurface,
    Timestamp, VisualPhase,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::clustering::Cluster;
use crate::ranking::haversine_distance;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Animation timings and matching thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Appearance animation length (default: 300 ms)
    pub appear_ms: u64,

    /// Move interpolation length (default: 250 ms)
    pub move_ms: u64,

    /// Disappearance animation length (default: 200 ms)
    pub disappear_ms: u64,

    /// Delay between consecutive appearances in one pass (default: 40 ms)
    pub stagger_step_ms: u64,

    /// Upper bound on the last appearance delay of a pass (default: 600 ms)
    pub stagger_cap_ms: u64,

    /// Target shift below which a marker is left alone (default: 1 m)
    pub move_epsilon_m: f64,

    /// Minimum Jaccard overlap for a cluster to keep its id (default: 0.5)
    pub cluster_match_overlap: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            appear_ms: 300,
            move_ms: 250,
            disappear_ms: 200,
            stagger_step_ms: 40,
            stagger_cap_ms: 600,
            move_epsilon_m: 1.0,
            cluster_match_overlap: 0.5,
        }
    }
}

// ============================================================================
// VISUAL STATE
// ============================================================================

/// Animation state of one rendered marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerVisualState {
    pub id: MarkerId,
    pub phase: VisualPhase,

    /// Animation start position; differs from `target` while moving or
    /// while appearing out of a former cluster
    pub from: Position,

    /// Animation end position
    pub target: Position,

    /// When the animation starts (after any stagger delay)
    pub started_at: Timestamp,

    pub duration_ms: u64,

    /// Peers behind the marker, sorted
    pub members: Vec<PeerId>,

    pub online_count: usize,
}

impl MarkerVisualState {
    /// When the current animation finishes; `None` while idle.
    pub fn deadline(&self) -> Option<Timestamp> {
        match self.phase {
            VisualPhase::Idle => None,
            _ => Some(self.started_at + self.duration_ms as i64),
        }
    }

    /// Animation progress in [0, 1].
    pub fn progress(&self, now: Timestamp) -> f64 {
        if self.duration_ms == 0 {
            return 1.0;
        }
        let elapsed = (now - self.started_at) as f64;
        (elapsed / self.duration_ms as f64).clamp(0.0, 1.0)
    }

    /// Current on-screen position.
    pub fn position_at(&self, now: Timestamp) -> Position {
        match self.phase {
            VisualPhase::Moving | VisualPhase::Appearing => {
                interpolate(&self.from, &self.target, self.progress(now))
            }
            _ => self.target,
        }
    }

    fn placement(&self, now: Timestamp) -> MarkerPlacement {
        let delay_ms = (self.started_at - now).max(0) as u64;
        let remaining_ms = match self.deadline() {
            Some(deadline) => (deadline - now.max(self.started_at)).max(0) as u64,
            None => 0,
        };
        let (member_count, online_count) = match self.id {
            MarkerId::Cluster(_) => (Some(self.members.len()), Some(self.online_count)),
            MarkerId::Peer(_) => (None, None),
        };
        MarkerPlacement {
            id: self.id,
            position: self.target,
            from: match self.phase {
                VisualPhase::Moving => Some(self.from),
                VisualPhase::Appearing if self.from != self.target => Some(self.from),
                _ => None,
            },
            phase: self.phase,
            member_count,
            online_count,
            delay_ms,
            duration_ms: remaining_ms,
        }
    }
}

/// Linear interpolation taking the short way around the antimeridian.
pub fn interpolate(from: &Position, to: &Position, t: f64) -> Position {
    let mut d_lng = to.lng - from.lng;
    if d_lng > 180.0 {
        d_lng -= 360.0;
    } else if d_lng < -180.0 {
        d_lng += 360.0;
    }
    let mut lng = from.lng + d_lng * t;
    if lng > 180.0 {
        lng -= 360.0;
    } else if lng < -180.0 {
        lng += 360.0;
    }
    Position::new(from.lat + (to.lat - from.lat) * t, lng)
}

// ============================================================================
// BATCHES
// ============================================================================

/// Ordered render commands produced by one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderBatch {
    pub commands: Vec<RenderCommand>,
}

impl RenderBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: RenderCommand) {
        self.commands.push(command);
    }

    pub fn append(&mut self, other: RenderBatch) {
        self.commands.extend(other.commands);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderCommand> {
        self.commands.iter()
    }

    /// Placements in this batch with the given phase.
    pub fn placements(&self, phase: VisualPhase) -> impl Iterator<Item = &MarkerPlacement> {
        self.commands.iter().filter_map(move |command| match command {
            RenderCommand::Render(placement) if placement.phase == phase => Some(placement),
            _ => None,
        })
    }

    /// Ids removed by this batch.
    pub fn removals(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.commands.iter().filter_map(|command| match command {
            RenderCommand::Remove(id) => Some(*id),
            _ => None,
        })
    }
}

/// Result of pushing a batch into a rendering surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
}

/// Sends every command to the surface. A failing command is logged and
/// skipped; the rest of the batch still goes out.
pub fn apply_batch<S: RenderSurface + ?Sized>(batch: &RenderBatch, surface: &mut S) -> ApplyReport {
    let mut report = ApplyReport::default();
    for command in batch.iter() {
        let result = match command {
            RenderCommand::Render(placement) => surface.render_marker(placement),
            RenderCommand::Remove(id) => surface.remove_marker(*id),
        };
        match result {
            Ok(()) => report.applied += 1,
            Err(e) => {
                tracing::warn!("render command for {} failed: {}", command.marker_id(), e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Output of [`MarkerLifecycle::tick`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub batch: RenderBatch,

    /// Markers whose disappearance finished and whose state is gone
    pub removed: Vec<MarkerId>,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Owns every [`MarkerVisualState`].
#[derive(Debug, Default)]
pub struct MarkerLifecycle {
    config: LifecycleConfig,
    markers: BTreeMap<MarkerId, MarkerVisualState>,
    next_cluster_id: u64,
}

impl MarkerLifecycle {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            markers: BTreeMap::new(),
            next_cluster_id: 0,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn get(&self, id: &MarkerId) -> Option<&MarkerVisualState> {
        self.markers.get(id)
    }

    pub fn contains(&self, id: &MarkerId) -> bool {
        self.markers.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerVisualState> {
        self.markers.values()
    }

    /// Markers currently on the map and not on their way out.
    pub fn visible(&self) -> impl Iterator<Item = &MarkerVisualState> {
        self.markers
            .values()
            .filter(|state| state.phase != VisualPhase::Disappearing)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Earliest pending animation deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.markers.values().filter_map(MarkerVisualState::deadline).min()
    }

    /// Offset of the `index`-th of `count` simultaneous arrivals.
    ///
    /// Offsets grow by `stagger_step_ms` and are compressed so the last one
    /// never exceeds `stagger_cap_ms`. Offsets are whole milliseconds, so once
    /// `count - 1` exceeds `stagger_cap_ms` neighbours can share an offset:
    /// they stay non-decreasing but are no longer strictly increasing.
    pub fn stagger_delay(&self, index: usize, count: usize) -> u64 {
        if count <= 1 {
            return 0;
        }
        let cap_step = self.config.stagger_cap_ms as f64 / (count - 1) as f64;
        let step = (self.config.stagger_step_ms as f64).min(cap_step);
        (index as f64 * step).floor() as u64
    }

    /// Diffs `clusters` against the previous frame.
    ///
    /// Clusters are taken in the given order; earlier arrivals appear first.
    pub fn reconcile(&mut self, clusters: &[Cluster], now: Timestamp) -> RenderBatch {
        self.reconcile_from(clusters, now, |_| None)
    }

    /// Like [`reconcile`](Self::reconcile), but arrivals for which `origin`
    /// returns a position grow out of it instead of popping in place.
    pub fn reconcile_from<F>(&mut self, clusters: &[Cluster], now: Timestamp, origin: F) -> RenderBatch
    where
        F: Fn(&Cluster) -> Option<Position>,
    {
        let ids = self.assign_ids(clusters);
        let present: HashSet<MarkerId> = ids.iter().copied().collect();

        let mut leaving = RenderBatch::new();
        let mut updates = RenderBatch::new();
        let mut arrivals: Vec<(MarkerId, &Cluster)> = Vec::new();

        for (id, cluster) in ids.iter().zip(clusters) {
            let state = match self.markers.get_mut(id) {
                Some(state) if state.phase != VisualPhase::Disappearing => state,
                _ => {
                    arrivals.push((*id, cluster));
                    continue;
                }
            };

            let moved =
                haversine_distance(&state.target, &cluster.centroid) > self.config.move_epsilon_m;
            let meta_changed =
                state.members != cluster.members || state.online_count != cluster.online_count;
            state.members = cluster.members.clone();
            state.online_count = cluster.online_count;

            if moved {
                if state.phase == VisualPhase::Appearing {
                    // Not settled yet: retarget the appearance
                    state.from = cluster.centroid;
                    state.target = cluster.centroid;
                } else {
                    state.from = state.position_at(now);
                    state.target = cluster.centroid;
                    state.phase = VisualPhase::Moving;
                    state.started_at = now;
                    state.duration_ms = self.config.move_ms;
                }
                updates.push(RenderCommand::Render(state.placement(now)));
            } else if meta_changed {
                updates.push(RenderCommand::Render(state.placement(now)));
            }
        }

        for (id, state) in self.markers.iter_mut() {
            if present.contains(id) || state.phase == VisualPhase::Disappearing {
                continue;
            }
            if state.phase == VisualPhase::Appearing {
                tracing::debug!("cancelling appearance of {}", id);
            }
            let position = state.position_at(now);
            state.phase = VisualPhase::Disappearing;
            state.from = position;
            state.target = position;
            state.started_at = now;
            state.duration_ms = self.config.disappear_ms;
            leaving.push(RenderCommand::Render(state.placement(now)));
        }

        let count = arrivals.len();
        let mut appearing = RenderBatch::new();
        for (index, (id, cluster)) in arrivals.into_iter().enumerate() {
            let delay = self.stagger_delay(index, count);
            let state = MarkerVisualState {
                id,
                phase: VisualPhase::Appearing,
                from: origin(cluster).unwrap_or(cluster.centroid),
                target: cluster.centroid,
                started_at: now + delay as i64,
                duration_ms: self.config.appear_ms,
                members: cluster.members.clone(),
                online_count: cluster.online_count,
            };
            appearing.push(RenderCommand::Render(state.placement(now)));
            self.markers.insert(id, state);
        }

        let mut batch = leaving;
        batch.append(updates);
        batch.append(appearing);

        if !batch.is_empty() {
            tracing::debug!(
                "reconciled {} clusters: {} commands ({} appearing)",
                clusters.len(),
                batch.len(),
                count
            );
        }
        batch
    }

    /// Settles every animation whose deadline is at or before `now`.
    pub fn tick(&mut self, now: Timestamp) -> TickOutcome {
        let due: Vec<MarkerId> = self
            .markers
            .values()
            .filter(|state| state.deadline().is_some_and(|deadline| deadline <= now))
            .map(|state| state.id)
            .collect();

        let mut outcome = TickOutcome::default();
        for id in due {
            let finished_disappearing = match self.markers.get_mut(&id) {
                Some(state) if state.phase == VisualPhase::Disappearing => true,
                Some(state) => {
                    state.started_at += state.duration_ms as i64;
                    state.phase = VisualPhase::Idle;
                    state.from = state.target;
                    state.duration_ms = 0;
                    false
                }
                None => false,
            };
            if finished_disappearing {
                self.markers.remove(&id);
                outcome.batch.push(RenderCommand::Remove(id));
                outcome.removed.push(id);
            }
        }
        outcome
    }

    /// Maps each cluster to a marker id.
    ///
    /// Singletons render as their peer. Multi-member clusters inherit the id
    /// of the previous cluster marker with the best member overlap (greedy,
    /// each previous id used once); the rest get fresh ids.
    fn assign_ids(&mut self, clusters: &[Cluster]) -> Vec<MarkerId> {
        let mut owner: HashMap<PeerId, ClusterId> = HashMap::new();
        let mut previous_size: HashMap<ClusterId, usize> = HashMap::new();
        for state in self.visible() {
            if let MarkerId::Cluster(cluster_id) = state.id {
                previous_size.insert(cluster_id, state.members.len());
                for member in &state.members {
                    owner.insert(*member, cluster_id);
                }
            }
        }

        let mut candidates: Vec<(f64, ClusterId, usize)> = Vec::new();
        for (index, cluster) in clusters.iter().enumerate() {
            if cluster.is_singleton {
                continue;
            }
            let mut overlaps: HashMap<ClusterId, usize> = HashMap::new();
            for member in &cluster.members {
                if let Some(cluster_id) = owner.get(member) {
                    *overlaps.entry(*cluster_id).or_default() += 1;
                }
            }
            for (cluster_id, overlap) in overlaps {
                let union = cluster.members.len() + previous_size[&cluster_id] - overlap;
                let jaccard = overlap as f64 / union as f64;
                if jaccard >= self.config.cluster_match_overlap {
                    candidates.push((jaccard, cluster_id, index));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut inherited: HashMap<usize, ClusterId> = HashMap::new();
        let mut taken: HashSet<ClusterId> = HashSet::new();
        for (_, cluster_id, index) in candidates {
            if inherited.contains_key(&index) || taken.contains(&cluster_id) {
                continue;
            }
            inherited.insert(index, cluster_id);
            taken.insert(cluster_id);
        }

        clusters
            .iter()
            .enumerate()
            .map(|(index, cluster)| {
                if cluster.is_singleton {
                    MarkerId::Peer(cluster.members[0])
                } else {
                    let cluster_id = match inherited.get(&index) {
                        Some(cluster_id) => *cluster_id,
                        None => self.allocate_cluster_id(),
                    };
                    MarkerId::Cluster(cluster_id)
                }
            })
            .collect()
    }

    fn allocate_cluster_id(&mut self) -> ClusterId {
        let id = ClusterId(self.next_cluster_id);
        self.next_cluster_id += 1;
        id
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::ClusterKey;
    use approx::assert_relative_eq;
    use nearby_env::EnvError;

    const T0: Timestamp = 1_703_001_600_000;

    fn pid(seed: u64) -> PeerId {
        PeerId::from_seed(seed)
    }

    fn singleton(seed: u64, lat: f64, lng: f64) -> Cluster {
        Cluster {
            key: ClusterKey::Peer(pid(seed)),
            centroid: Position::new(lat, lng),
            members: vec![pid(seed)],
            online_count: 1,
            is_singleton: true,
        }
    }

    fn group(seeds: &[u64], lat: f64, lng: f64) -> Cluster {
        let mut members: Vec<PeerId> = seeds.iter().map(|s| pid(*s)).collect();
        members.sort();
        Cluster {
            key: ClusterKey::Mercator { x: 0, y: 0 },
            centroid: Position::new(lat, lng),
            online_count: members.len(),
            members,
            is_singleton: false,
        }
    }

    fn settle(lifecycle: &mut MarkerLifecycle, now: Timestamp) -> TickOutcome {
        lifecycle.tick(now + 10_000)
    }

    #[test]
    fn test_five_arrivals_are_staggered() {
        let mut lifecycle = MarkerLifecycle::default();
        let clusters: Vec<Cluster> = (0..5).map(|i| singleton(i, 0.0, i as f64 * 0.01)).collect();

        let batch = lifecycle.reconcile(&clusters, T0);
        let delays: Vec<u64> = batch.placements(VisualPhase::Appearing).map(|p| p.delay_ms).collect();

        assert_eq!(delays.len(), 5);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert!(*delays.last().unwrap() <= lifecycle.config().stagger_cap_ms);
        assert_eq!(delays, vec![0, 40, 80, 120, 160]);
    }

    #[test]
    fn test_large_burst_stagger_is_capped() {
        let mut lifecycle = MarkerLifecycle::default();
        let clusters: Vec<Cluster> = (0..50).map(|i| singleton(i, 0.0, i as f64 * 0.01)).collect();

        let batch = lifecycle.reconcile(&clusters, T0);
        let delays: Vec<u64> = batch.placements(VisualPhase::Appearing).map(|p| p.delay_ms).collect();

        assert_eq!(delays.len(), 50);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert!(delays.iter().all(|d| *d <= 600));
    }

    #[test]
    fn test_identical_frame_emits_nothing() {
        let mut lifecycle = MarkerLifecycle::default();
        let clusters = vec![singleton(1, 0.0, 0.0), group(&[2, 3, 4], 1.0, 1.0)];

        assert_eq!(lifecycle.reconcile(&clusters, T0).len(), 2);
        // Mid-animation and after settling
        assert!(lifecycle.reconcile(&clusters, T0 + 50).is_empty());
        settle(&mut lifecycle, T0);
        assert!(lifecycle.reconcile(&clusters, T0 + 20_000).is_empty());
    }

    #[test]
    fn test_move_beyond_epsilon() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[singleton(1, 0.0, 0.0)], T0);
        settle(&mut lifecycle, T0);

        let now = T0 + 20_000;
        let batch = lifecycle.reconcile(&[singleton(1, 0.0, 0.001)], now);
        let moves: Vec<&MarkerPlacement> = batch.placements(VisualPhase::Moving).collect();

        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].from, Some(Position::new(0.0, 0.0)));
        assert_eq!(moves[0].position, Position::new(0.0, 0.001));
        assert_eq!(moves[0].duration_ms, 250);

        let state = lifecycle.get(&MarkerId::Peer(pid(1))).unwrap();
        let midway = state.position_at(now + 125);
        assert_relative_eq!(midway.lng, 0.0005, epsilon = 1e-9);
    }

    #[test]
    fn test_move_within_epsilon_ignored() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[singleton(1, 0.0, 0.0)], T0);
        settle(&mut lifecycle, T0);

        // ~0.1 m
        let batch = lifecycle.reconcile(&[singleton(1, 0.0, 0.000001)], T0 + 20_000);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_disappearance_precedes_removal() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[singleton(1, 0.0, 0.0), singleton(2, 0.0, 0.1)], T0);
        settle(&mut lifecycle, T0);

        let now = T0 + 20_000;
        let batch = lifecycle.reconcile(&[singleton(2, 0.0, 0.1)], now);
        let leaving: Vec<MarkerId> = batch.placements(VisualPhase::Disappearing).map(|p| p.id).collect();
        assert_eq!(leaving, vec![MarkerId::Peer(pid(1))]);
        assert_eq!(batch.removals().count(), 0);

        let early = lifecycle.tick(now + 100);
        assert!(early.batch.is_empty());
        assert!(lifecycle.contains(&MarkerId::Peer(pid(1))));

        let done = lifecycle.tick(now + 200);
        assert_eq!(done.removed, vec![MarkerId::Peer(pid(1))]);
        assert_eq!(done.batch.removals().collect::<Vec<_>>(), vec![MarkerId::Peer(pid(1))]);
        assert!(!lifecycle.contains(&MarkerId::Peer(pid(1))));
    }

    #[test]
    fn test_disappearing_during_appearance_cancels_it() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[singleton(1, 0.0, 0.0)], T0);

        let batch = lifecycle.reconcile(&[], T0 + 50);
        assert_eq!(batch.placements(VisualPhase::Disappearing).count(), 1);

        let state = lifecycle.get(&MarkerId::Peer(pid(1))).unwrap();
        assert_eq!(state.phase, VisualPhase::Disappearing);
        assert_eq!(state.deadline(), Some(T0 + 250));

        // The old appearance deadline (T0 + 300) no longer exists
        let outcome = lifecycle.tick(T0 + 250);
        assert_eq!(outcome.removed, vec![MarkerId::Peer(pid(1))]);
        assert!(lifecycle.is_empty());
    }

    #[test]
    fn test_settling_is_silent() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[singleton(1, 0.0, 0.0)], T0);
        assert_eq!(lifecycle.next_deadline(), Some(T0 + 300));

        let outcome = lifecycle.tick(T0 + 300);
        assert!(outcome.batch.is_empty());
        assert_eq!(
            lifecycle.get(&MarkerId::Peer(pid(1))).unwrap().phase,
            VisualPhase::Idle
        );
        assert_eq!(lifecycle.next_deadline(), None);
    }

    #[test]
    fn test_cluster_keeps_id_when_member_leaves() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[group(&[1, 2, 3, 4], 1.0, 1.0)], T0);
        settle(&mut lifecycle, T0);
        let first_id = lifecycle.visible().next().unwrap().id;

        let batch = lifecycle.reconcile(&[group(&[1, 2, 3], 1.0, 1.0), singleton(4, 1.2, 1.2)], T0 + 20_000);

        let updated: Vec<&MarkerPlacement> = batch.placements(VisualPhase::Idle).collect();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, first_id);
        assert_eq!(updated[0].member_count, Some(3));
        assert_eq!(batch.placements(VisualPhase::Appearing).count(), 1);
        assert_eq!(batch.placements(VisualPhase::Disappearing).count(), 0);
    }

    #[test]
    fn test_cluster_split_allocates_one_new_id() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[group(&[1, 2, 3, 4], 1.0, 1.0)], T0);
        settle(&mut lifecycle, T0);
        let original = lifecycle.visible().next().unwrap().id;

        lifecycle.reconcile(&[group(&[1, 2], 1.0, 1.0), group(&[3, 4], 2.0, 2.0)], T0 + 20_000);

        let ids: Vec<MarkerId> = lifecycle.visible().map(|s| s.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&original));
    }

    #[test]
    fn test_unrelated_cluster_gets_fresh_id() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[group(&[1, 2, 3, 4], 1.0, 1.0)], T0);
        settle(&mut lifecycle, T0);

        let batch = lifecycle.reconcile(&[group(&[5, 6, 7], 1.0, 1.0)], T0 + 20_000);
        assert_eq!(batch.placements(VisualPhase::Disappearing).count(), 1);
        assert_eq!(batch.placements(VisualPhase::Appearing).count(), 1);
    }

    #[test]
    fn test_disappearing_marker_can_return() {
        let mut lifecycle = MarkerLifecycle::default();
        lifecycle.reconcile(&[singleton(1, 0.0, 0.0)], T0);
        settle(&mut lifecycle, T0);
        lifecycle.reconcile(&[], T0 + 20_000);

        let batch = lifecycle.reconcile(&[singleton(1, 0.0, 0.0)], T0 + 20_050);
        assert_eq!(batch.placements(VisualPhase::Appearing).count(), 1);
        assert_eq!(
            lifecycle.get(&MarkerId::Peer(pid(1))).unwrap().phase,
            VisualPhase::Appearing
        );
    }

    #[test]
    fn test_huge_burst_offsets_never_decrease() {
        let lifecycle = MarkerLifecycle::default();
        let count = 700;
        let delays: Vec<u64> = (0..count).map(|i| lifecycle.stagger_delay(i, count)).collect();

        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.windows(2).any(|w| w[0] == w[1]));
        let cap = lifecycle.config().stagger_cap_ms;
        assert!(*delays.last().unwrap() <= cap);
        assert!(*delays.last().unwrap() + 1 >= cap);
    }

    #[test]
    fn test_arrival_grows_out_of_origin() {
        let mut lifecycle = MarkerLifecycle::default();
        let origin = Position::new(1.0, 1.0);
        let split = [singleton(1, 1.0, 1.01), singleton(2, 1.0, 0.99)];

        let batch = lifecycle.reconcile_from(&split, T0, |cluster| {
            (cluster.members[0] == pid(1)).then_some(origin)
        });
        let appearing: Vec<&MarkerPlacement> = batch.placements(VisualPhase::Appearing).collect();
        assert_eq!(appearing.len(), 2);
        assert_eq!(appearing[0].from, Some(origin));
        assert_eq!(appearing[0].position, Position::new(1.0, 1.01));
        assert_eq!(appearing[1].from, None);

        let state = lifecycle.get(&MarkerId::Peer(pid(1))).unwrap();
        assert_eq!(state.position_at(T0), origin);
        let halfway = state.position_at(T0 + 150);
        assert_relative_eq!(halfway.lng, 1.005, epsilon = 1e-9);

        settle(&mut lifecycle, T0);
        let state = lifecycle.get(&MarkerId::Peer(pid(1))).unwrap();
        assert_eq!(state.position_at(T0 + 20_000), Position::new(1.0, 1.01));
    }

    #[test]
    fn test_interpolate_short_way_round() {
        let p = interpolate(&Position::new(0.0, 179.0), &Position::new(0.0, -179.0), 0.25);
        assert_relative_eq!(p.lng, 179.5, epsilon = 1e-9);
    }

    struct FlakySurface {
        fail_on: MarkerId,
        rendered: Vec<MarkerId>,
    }

    impl RenderSurface for FlakySurface {
        fn render_marker(&mut self, placement: &MarkerPlacement) -> Result<(), EnvError> {
            if placement.id == self.fail_on {
                return Err(EnvError::render(placement.id, "surface detached"));
            }
            self.rendered.push(placement.id);
            Ok(())
        }

        fn remove_marker(&mut self, _id: MarkerId) -> Result<(), EnvError> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_command_does_not_block_batch() {
        let mut lifecycle = MarkerLifecycle::default();
        let clusters: Vec<Cluster> = (0..4).map(|i| singleton(i, 0.0, i as f64 * 0.01)).collect();
        let batch = lifecycle.reconcile(&clusters, T0);

        let mut surface = FlakySurface {
            fail_on: MarkerId::Peer(pid(1)),
            rendered: Vec::new(),
        };
        let report = apply_batch(&batch, &mut surface);

        assert_eq!(report, ApplyReport { applied: 3, failed: 1 });
        assert_eq!(surface.rendered.len(), 3);
        assert!(!surface.rendered.contains(&MarkerId::Peer(pid(1))));
    }
}
