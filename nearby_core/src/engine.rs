//! Engine Facade - orchestrates throttle, ranking, clustering and lifecycle.
//!
//! # Pipeline
//!
//! ```text
//!  submit_peer_reports ─┐
//!  remove_peer ─────────┤            ┌──────────────────────────────────────┐
//!  set_viewport ────────┼─► pending ─►  validate ─► throttle ─► rank        │
//!  set_viewer_position ─┘  (coalesced)│      ─► cluster ─► reconcile ─► batch│
//!                                    └──────────────────────────────────────┘
//! ```
//!
//! Inbound calls only queue work. A pass drains everything queued since the
//! previous pass, so a burst of telemetry collapses into one reconciliation.
//! `&mut self` on every mutating method is what guarantees a single pass in
//! flight; the async [`crate::runtime`] serializes callers onto one task.
//!
//! Viewport-only changes skip the throttle but still re-rank and re-cluster.

use nearby_env::{MarkerId, PeerId, PeerReport, Position, RenderSurface, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::clustering::{Cluster, ClusterConfig, SpatialClusterer};
use crate::error::EngineError;
use crate::lifecycle::{
    apply_batch, ApplyReport, LifecycleConfig, MarkerLifecycle, MarkerVisualState, RenderBatch,
};
use crate::ranking::{ProximityCalculator, ProximityRecord, RankingConfig};
use crate::throttle::{ThrottleConfig, UpdateThrottle};
use crate::tracking::{BucketCounts, PeerTable, TrackedPeer};
use crate::validation::{validate_position, validate_report, ValidationError};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ranking: RankingConfig,
    pub throttle: ThrottleConfig,
    pub clustering: ClusterConfig,
    pub lifecycle: LifecycleConfig,

    /// Minimum time between two clustering passes (default: 32 ms)
    pub clustering_debounce_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ranking: RankingConfig::default(),
            throttle: ThrottleConfig::default(),
            clustering: ClusterConfig::default(),
            lifecycle: LifecycleConfig::default(),
            clustering_debounce_ms: 32,
        }
    }
}

impl EngineConfig {
    /// Parses a (possibly partial) JSON document; missing fields keep defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

/// Camera state from the viewport provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub zoom: f64,
    pub center: Position,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            zoom: 15.0,
            center: Position::new(0.0, 0.0),
        }
    }
}

// ============================================================================
// OUTPUTS
// ============================================================================

/// A tap on a rendered marker, forwarded to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerActivation {
    pub id: MarkerId,

    /// Peers behind the marker (one for a peer marker)
    pub members: Vec<PeerId>,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub tracked_peers: usize,
    pub rendered_markers: usize,
    pub reports_accepted: u64,
    pub reports_throttled: u64,
    pub reports_invalid: u64,
    pub removals: u64,
    pub passes: u64,
    pub render_failures: u64,
    pub buckets: BucketCounts,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    reports_accepted: u64,
    reports_throttled: u64,
    reports_invalid: u64,
    removals: u64,
    passes: u64,
    render_failures: u64,
}

#[derive(Debug, Clone)]
enum Inbound {
    Report(PeerReport),
    Remove(PeerId),
}

/// Work queued since the last pass.
#[derive(Debug, Default)]
struct PendingWork {
    /// Reports and removals, in arrival order
    events: Vec<Inbound>,
    /// Latest viewport (last one wins)
    viewport: Option<Viewport>,
    /// Latest viewer position (last one wins)
    viewer: Option<Option<Position>>,
}

impl PendingWork {
    fn is_empty(&self) -> bool {
        self.events.is_empty() && self.viewport.is_none() && self.viewer.is_none()
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// The single owner of all tracked-peer, cluster and marker state.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    calculator: ProximityCalculator,
    throttle: UpdateThrottle,
    clusterer: SpatialClusterer,
    lifecycle: MarkerLifecycle,
    peers: PeerTable,
    clusters: Vec<Cluster>,
    viewer: Option<Position>,
    viewport: Viewport,
    pending: PendingWork,
    last_pass_at: Option<Timestamp>,
    counters: Counters,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            calculator: ProximityCalculator::new(config.ranking.clone()),
            throttle: UpdateThrottle::new(config.throttle.clone()),
            clusterer: SpatialClusterer::new(config.clustering.clone()),
            lifecycle: MarkerLifecycle::new(config.lifecycle.clone()),
            config,
            peers: PeerTable::new(),
            clusters: Vec::new(),
            viewer: None,
            viewport: Viewport::default(),
            pending: PendingWork::default(),
            last_pass_at: None,
            counters: Counters::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // === Inbound (queue only) ===

    /// Queues a telemetry batch.
    pub fn submit_peer_reports(&mut self, batch: impl IntoIterator<Item = PeerReport>) {
        self.pending
            .events
            .extend(batch.into_iter().map(Inbound::Report));
    }

    /// Queues an explicit removal (unfriend / stopped sharing).
    pub fn remove_peer(&mut self, id: PeerId) {
        self.pending.events.push(Inbound::Remove(id));
    }

    /// Queues a camera change.
    pub fn set_viewport(&mut self, zoom: f64, center: Position) -> Result<(), EngineError> {
        if !zoom.is_finite() || zoom < 0.0 {
            tracing::warn!("ignoring viewport with zoom {}", zoom);
            return Err(EngineError::InvalidZoom(zoom));
        }
        validate_position(&center).map_err(|e| {
            tracing::warn!("ignoring viewport centered at invalid position: {}", e);
            e
        })?;
        self.pending.viewport = Some(Viewport { zoom, center });
        Ok(())
    }

    /// Queues a change of the viewer's own location.
    pub fn set_viewer_position(&mut self, position: Option<Position>) -> Result<(), ValidationError> {
        if let Some(position) = &position {
            validate_position(position).map_err(|e| {
                tracing::warn!("ignoring invalid viewer position: {}", e);
                e
            })?;
        }
        self.pending.viewer = Some(position);
        Ok(())
    }

    pub fn has_pending_work(&self) -> bool {
        !self.pending.is_empty()
    }

    // === Immediate entry points ===
    //
    // Each queues its input and then behaves like `poll`: a pass runs only
    // once the clustering debounce elapsed. Inside the window the work stays
    // queued and the batch holds at most finished animations; call again at
    // `next_wakeup`.

    /// Queues a batch and runs a pass if one is due.
    pub fn on_telemetry_batch(&mut self, reports: Vec<PeerReport>, now: Timestamp) -> RenderBatch {
        self.submit_peer_reports(reports);
        self.poll(now).unwrap_or_default()
    }

    /// Applies a camera change and runs a pass if one is due.
    pub fn on_viewport_changed(
        &mut self,
        zoom: f64,
        center: Position,
        now: Timestamp,
    ) -> Result<RenderBatch, EngineError> {
        self.set_viewport(zoom, center)?;
        Ok(self.poll(now).unwrap_or_default())
    }

    /// Applies a viewer move and runs a pass if one is due.
    pub fn on_viewer_position_changed(
        &mut self,
        position: Option<Position>,
        now: Timestamp,
    ) -> Result<RenderBatch, EngineError> {
        self.set_viewer_position(position)?;
        Ok(self.poll(now).unwrap_or_default())
    }

    /// Queues a removal and runs a pass if one is due.
    pub fn on_peer_removed(&mut self, id: PeerId, now: Timestamp) -> RenderBatch {
        self.remove_peer(id);
        self.poll(now).unwrap_or_default()
    }

    /// Resolves a tap on a rendered marker.
    pub fn on_marker_activated(&self, id: MarkerId) -> Option<MarkerActivation> {
        match self.lifecycle.get(&id) {
            Some(state) => Some(MarkerActivation {
                id,
                members: state.members.clone(),
            }),
            None => {
                tracing::debug!("activation for unknown marker {}", id);
                None
            }
        }
    }

    // === Scheduling ===

    /// Runs whatever is due: a pass if work is queued and the debounce
    /// elapsed, otherwise any finished animations. `None` when idle.
    pub fn poll(&mut self, now: Timestamp) -> Option<RenderBatch> {
        if self.is_pass_due(now) {
            return Some(self.run_pass(now));
        }
        if self
            .lifecycle
            .next_deadline()
            .is_some_and(|deadline| deadline <= now)
        {
            return Some(self.tick(now));
        }
        None
    }

    /// Earliest pending animation completion.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.lifecycle.next_deadline()
    }

    /// When `poll` next has something to do.
    pub fn next_wakeup(&self, now: Timestamp) -> Option<Timestamp> {
        let pass = if self.pending.is_empty() {
            None
        } else {
            Some(self.debounce_until().unwrap_or(now))
        };
        match (pass, self.lifecycle.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn debounce_until(&self) -> Option<Timestamp> {
        self.last_pass_at
            .map(|last| last + self.config.clustering_debounce_ms)
    }

    fn is_pass_due(&self, now: Timestamp) -> bool {
        !self.pending.is_empty() && self.debounce_until().map_or(true, |until| now >= until)
    }

    // === Passes ===

    /// Drains all queued work and runs one full reconciliation pass.
    pub fn run_pass(&mut self, now: Timestamp) -> RenderBatch {
        let pending = std::mem::take(&mut self.pending);
        let mut rerank_all = false;

        if let Some(viewer) = pending.viewer {
            self.viewer = viewer;
            rerank_all = true;
        }
        if let Some(viewport) = pending.viewport {
            self.viewport = viewport;
            rerank_all = true;
        }

        for event in pending.events {
            match event {
                Inbound::Report(report) => self.ingest_report(report, now),
                Inbound::Remove(id) => self.ingest_removal(id),
            }
        }

        if rerank_all {
            self.rerank_all(now);
        }

        let mut batch = self.tick(now);

        let clusters = self.cluster_live();
        let peers = &self.peers;
        batch.append(self.lifecycle.reconcile_from(&clusters, now, |cluster| {
            match cluster.members.as_slice() {
                [only] => peers.get(only).and_then(|peer| peer.rendered_position),
                _ => None,
            }
        }));
        self.record_rendered_positions(&clusters);
        self.clusters = clusters;
        self.purge_unrendered_removals();

        self.last_pass_at = Some(now);
        self.counters.passes += 1;

        tracing::debug!(
            "pass {}: {} peers, {} clusters, {} commands",
            self.counters.passes,
            self.peers.len(),
            self.clusters.len(),
            batch.len()
        );
        batch
    }

    /// Settles finished animations and deletes peers whose disappearance
    /// completed.
    pub fn tick(&mut self, now: Timestamp) -> RenderBatch {
        let outcome = self.lifecycle.tick(now);
        for id in outcome.removed {
            if let MarkerId::Peer(peer_id) = id {
                if self.peers.get(&peer_id).is_some_and(|peer| peer.removed) {
                    self.peers.remove(&peer_id);
                    tracing::debug!("peer {} deleted after disappearing", peer_id);
                }
            }
        }
        outcome.batch
    }

    /// Pushes a batch into the rendering surface, isolating failures.
    pub fn flush<S: RenderSurface + ?Sized>(&mut self, batch: &RenderBatch, surface: &mut S) -> ApplyReport {
        let report = apply_batch(batch, surface);
        self.counters.render_failures += report.failed as u64;
        report
    }

    fn ingest_report(&mut self, report: PeerReport, now: Timestamp) {
        if let Err(e) = validate_report(&report) {
            tracing::warn!("rejecting report for {}: {}", report.id, e);
            self.counters.reports_invalid += 1;
            return;
        }

        if !self.throttle.accept(&report, now).is_accepted() {
            self.counters.reports_throttled += 1;
            return;
        }
        self.counters.reports_accepted += 1;

        let proximity = self.score(&report, now);
        self.peers.upsert(report, proximity, now);
    }

    fn ingest_removal(&mut self, id: PeerId) {
        if self.peers.mark_removed(&id) {
            self.throttle.forget(&id);
            self.counters.removals += 1;
        } else {
            tracing::debug!("removal for untracked peer {}", id);
        }
    }

    fn score(&self, report: &PeerReport, now: Timestamp) -> ProximityRecord {
        match self.calculator.score(self.viewer.as_ref(), report, now) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("cannot score {}: {}", report.id, e);
                ProximityRecord::unknown()
            }
        }
    }

    fn rerank_all(&mut self, now: Timestamp) {
        let calculator = &self.calculator;
        let viewer = self.viewer;
        for peer in self.peers.iter_mut() {
            peer.proximity = calculator
                .score(viewer.as_ref(), &peer.report, now)
                .unwrap_or_else(|_| ProximityRecord::unknown());
        }
    }

    /// Clusters live peers and orders the result best-ranked first.
    fn cluster_live(&self) -> Vec<Cluster> {
        let clusters = self
            .clusterer
            .cluster(self.peers.live(), self.viewport.zoom, self.viewport.center);

        let mut ranked: Vec<(ProximityRecord, Cluster)> = clusters
            .into_iter()
            .map(|cluster| (self.best_rank(&cluster), cluster))
            .collect();
        ranked.sort_by(|a, b| a.0.rank_cmp(&b.0).then_with(|| a.1.key.cmp(&b.1.key)));
        ranked.into_iter().map(|(_, cluster)| cluster).collect()
    }

    fn best_rank(&self, cluster: &Cluster) -> ProximityRecord {
        let mut best = ProximityRecord::unknown();
        for member in &cluster.members {
            match self.peers.get(member) {
                Some(peer) => {
                    if peer.proximity.rank_cmp(&best).is_lt() {
                        best = peer.proximity;
                    }
                }
                None => {
                    debug_assert!(false, "cluster member {} is not tracked", member);
                    tracing::error!("cluster member {} is not tracked, skipping", member);
                }
            }
        }
        best
    }

    fn record_rendered_positions(&mut self, clusters: &[Cluster]) {
        for cluster in clusters {
            for member in &cluster.members {
                if let Some(peer) = self.peers.get_mut(member) {
                    peer.rendered_position = Some(cluster.centroid);
                }
            }
        }
    }

    /// Removed peers without an own marker have nothing left to animate.
    fn purge_unrendered_removals(&mut self) {
        for id in self.peers.removed_ids() {
            if !self.lifecycle.contains(&MarkerId::Peer(id)) {
                self.peers.remove(&id);
                tracing::debug!("peer {} deleted (no marker of its own)", id);
            }
        }
    }

    // === Queries ===

    /// Live peers in nearby-list order.
    pub fn ranked_peers(&self) -> Vec<&TrackedPeer> {
        self.peers.ranked()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&TrackedPeer> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &TrackedPeer> {
        self.peers.iter()
    }

    pub fn marker(&self, id: &MarkerId) -> Option<&MarkerVisualState> {
        self.lifecycle.get(id)
    }

    pub fn markers(&self) -> impl Iterator<Item = &MarkerVisualState> {
        self.lifecycle.iter()
    }

    /// Output of the most recent clustering pass.
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn viewer(&self) -> Option<Position> {
        self.viewer
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tracked_peers: self.peers.len(),
            rendered_markers: self.lifecycle.len(),
            reports_accepted: self.counters.reports_accepted,
            reports_throttled: self.counters.reports_throttled,
            reports_invalid: self.counters.reports_invalid,
            removals: self.counters.removals,
            passes: self.counters.passes,
            render_failures: self.counters.render_failures,
            buckets: self.peers.bucket_counts(),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================
