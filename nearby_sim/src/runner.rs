//! Scenario runner - drives the engine through deterministic scenarios.
//!
//! Every scenario runs the synchronous [`Engine`] against a seeded
//! [`PeerOracle`] on a virtual clock and checks, after every pass:
//! - each placeable live peer sits in exactly one cluster
//! - no cluster centroid is non-finite
//! - every `Remove` is preceded by a `Disappearing` render (surface check)
//! - appearance delays stay within the stagger cap
//!
//! and, once animations settle, that an unchanged frame emits nothing.

use crate::context::SimContext;
use crate::oracle::PeerOracle;
use crate::scenarios::ScenarioId;
use crate::surface::RecordingSurface;

use nearby_core::{Engine, EngineConfig, RenderBatch};
use nearby_env::{NearbyContext, PeerId, Position, Timestamp, VisualPhase};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the simulated viewer stands (Berlin Mitte).
pub const HOME: Position = Position::new(52.52, 13.405);

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Peers still tracked at the end
    pub final_peer_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    pub reports_sent: u64,
    pub reports_accepted: u64,
    pub reports_throttled: u64,
    pub reports_invalid: u64,
    pub removals_requested: u64,

    /// Engine passes run
    pub passes: u64,

    pub commands: u64,
    pub appearing: u64,
    pub moving: u64,
    pub disappearing: u64,
    pub removed_markers: u64,
    pub render_failures: u64,

    /// Fewest / most clusters seen after a pass with at least one peer
    pub min_clusters: Option<usize>,
    pub max_clusters: usize,

    /// Engine-state invariant checks performed
    pub invariant_checks: u64,
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of simulated peers
    num_peers: usize,

    /// Simulation step in milliseconds (default: 50)
    tick_ms: i64,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Engine configuration under test
    config: EngineConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers,
            tick_ms: 50,
            max_duration_secs: 10.0,
            config: EngineConfig::default(),
        }
    }

    /// Sets the simulation step.
    pub fn with_tick_ms(mut self, tick_ms: i64) -> Self {
        self.tick_ms = tick_ms.max(1);
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    fn total_ticks(&self) -> u64 {
        let ticks = self.max_duration_secs.max(0.0) * 1000.0 / self.tick_ms as f64;
        (ticks as u64).max(1)
    }

    fn harness(&self, surface: RecordingSurface) -> Harness {
        // Physics gets its own stream so surface failures never shift trajectories
        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        Harness::new(
            self.seed,
            self.config.clone(),
            PeerOracle::new(physics_seed, HOME),
            surface,
            self.tick_ms,
        )
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("  {}", scenario.description());

        let harness = match scenario {
            ScenarioId::BurstArrival => self.run_burst_arrival(),
            ScenarioId::NoisyTelemetry => self.run_noisy_telemetry(),
            ScenarioId::ZoomSweep => self.run_zoom_sweep(),
            ScenarioId::Unfriend => self.run_unfriend(),
            ScenarioId::FlakySurface => self.run_flaky_surface(),
            ScenarioId::Crowd => self.run_crowd(),
        };
        harness.finish(scenario, self.seed)
    }

    /// SIM-001: every peer arrives in the first batch.
    ///
    /// **Assertion**: the first pass places every cluster with non-decreasing
    /// delays, the last one within the stagger cap.
    fn run_burst_arrival(&self) -> Harness {
        let mut h = self.harness(RecordingSurface::new(self.seed));
        h.oracle.spawn_around(HOME, self.num_peers, 3_000.0, 0.3);
        h.set_viewer(Some(HOME));
        h.set_viewport(15.0, HOME);

        h.send_reports();
        let now = h.now();
        let first = h.engine.run_pass(now);

        let delays: Vec<u64> = first
            .placements(VisualPhase::Appearing)
            .map(|p| p.delay_ms)
            .collect();
        if delays.len() != h.engine.clusters().len() {
            h.fail(format!(
                "first pass placed {} markers for {} clusters",
                delays.len(),
                h.engine.clusters().len()
            ));
        }
        if delays.windows(2).any(|w| w[0] > w[1]) {
            h.fail("appearance delays are not monotonic".to_string());
        }
        h.apply(first);
        h.advance();

        for _ in 1..self.total_ticks() {
            h.step();
        }
        h.check_unchanged_frame();
        h
    }

    /// SIM-002: stationary peers with GPS jitter; one malformed report every
    /// tenth tick.
    ///
    /// **Assertion**: every report is accounted for, malformed ones are
    /// counted invalid, no peer is lost.
    fn run_noisy_telemetry(&self) -> Harness {
        let mut h = self.harness(RecordingSurface::new(self.seed));
        h.oracle.spawn_around(HOME, self.num_peers, 1_500.0, 0.0);
        h.oracle.set_position_noise(1.5);
        h.set_viewer(Some(HOME));
        h.set_viewport(16.0, HOME);

        let mut malformed = 0u64;
        for tick in 0..self.total_ticks() {
            if tick % 10 == 9 {
                let now = h.now();
                if let Some(report) = h.oracle.malformed_report(now) {
                    h.metrics.reports_sent += 1;
                    malformed += 1;
                    h.engine.submit_peer_reports(vec![report]);
                }
            }
            h.step();
        }

        let stats = h.engine.stats();
        if stats.reports_invalid != malformed {
            h.fail(format!(
                "{} malformed reports sent, {} counted invalid",
                malformed, stats.reports_invalid
            ));
        }
        if stats.tracked_peers != h.oracle.active_count() {
            h.fail(format!(
                "{} peers tracked, {} sharing",
                stats.tracked_peers,
                h.oracle.active_count()
            ));
        }
        if self.total_ticks() > 4 && self.num_peers > 0 && stats.reports_throttled == 0 {
            h.fail("jitter never throttled".to_string());
        }
        h.check_unchanged_frame();
        h
    }

    /// SIM-003: zoom out from street level to continent and back in.
    ///
    /// **Assertion**: zoomed out, peers collapse into fewer clusters; back at
    /// street level (below the count cutoff) every peer is its own marker.
    fn run_zoom_sweep(&self) -> Harness {
        let mut h = self.harness(RecordingSurface::new(self.seed));
        h.oracle.spawn_around(HOME, self.num_peers, 2_000.0, 0.3);
        h.set_viewer(Some(HOME));

        let levels: Vec<f64> = (3..=18).rev().chain(4..=18).map(f64::from).collect();
        let ticks_per_level = (self.total_ticks() / levels.len() as u64).max(1);

        for zoom in levels {
            h.set_viewport(zoom, HOME);
            for _ in 0..ticks_per_level {
                h.step();
            }
        }
        h.settle();

        let peers = h.oracle.active_count();
        if peers >= 5 && h.metrics.min_clusters.unwrap_or(peers) >= peers {
            h.fail(format!("{} peers never clustered at low zoom", peers));
        }
        if peers <= h.config().clustering.peer_count_cutoff && h.engine.clusters().len() != peers {
            h.fail(format!(
                "{} clusters at zoom 18 for {} peers",
                h.engine.clusters().len(),
                peers
            ));
        }
        h.check_unchanged_frame();
        h
    }

    /// SIM-004: half the peers stop sharing, one per tick, from 20% of the
    /// run onwards.
    ///
    /// **Assertion**: removed peers leave the engine entirely once their
    /// markers finished disappearing.
    fn run_unfriend(&self) -> Harness {
        let mut h = self.harness(RecordingSurface::new(self.seed));
        h.oracle.spawn_around(HOME, self.num_peers, 1_000.0, 0.3);
        h.set_viewer(Some(HOME));
        h.set_viewport(15.0, HOME);

        let total = self.total_ticks();
        let start = total / 5;
        let mut leaving: Vec<PeerId> = Vec::new();
        let mut gone: Vec<PeerId> = Vec::new();

        for tick in 0..total {
            if tick == start {
                leaving = h.oracle.pick_active(self.num_peers / 2);
            }
            if tick >= start {
                if let Some(id) = leaving.pop() {
                    h.oracle.retire(&id);
                    h.engine.remove_peer(id);
                    h.metrics.removals_requested += 1;
                    gone.push(id);
                }
            }
            h.step();
        }
        h.settle();

        for id in &gone {
            if h.engine.peer(id).is_some() {
                h.fail(format!("peer {} still tracked after removal", id));
            }
        }
        if h.engine.stats().tracked_peers != h.oracle.active_count() {
            h.fail(format!(
                "{} peers tracked, {} sharing",
                h.engine.stats().tracked_peers,
                h.oracle.active_count()
            ));
        }
        h.check_unchanged_frame();
        h
    }

    /// SIM-005: a fifth of all render commands fail.
    ///
    /// **Assertion**: the engine counts every failure and its own state
    /// invariants still hold.
    fn run_flaky_surface(&self) -> Harness {
        let surface = RecordingSurface::new(self.seed).with_failure_rate(0.2);
        let mut h = self.harness(surface);
        h.oracle.spawn_around(HOME, self.num_peers, 1_500.0, 0.5);
        h.oracle.set_status_flip_probability(0.01);
        h.set_viewer(Some(HOME));
        h.set_viewport(14.0, HOME);

        for _ in 0..self.total_ticks() {
            h.step();
        }
        h.settle();

        let counted = h.engine.stats().render_failures;
        if counted != h.surface.failures() {
            h.fail(format!(
                "surface failed {} commands, engine counted {}",
                h.surface.failures(),
                counted
            ));
        }
        h
    }

    /// SIM-006: more peers than the count cutoff in a small area at street
    /// zoom.
    ///
    /// **Assertion**: clustering kicks in on peer count alone.
    fn run_crowd(&self) -> Harness {
        let mut h = self.harness(RecordingSurface::new(self.seed));
        let crowd = self
            .num_peers
            .max(h.config().clustering.peer_count_cutoff * 2 + 10);
        h.oracle.spawn_around(HOME, crowd, 300.0, 0.3);
        h.set_viewer(Some(HOME));
        h.set_viewport(16.0, HOME);

        for _ in 0..self.total_ticks() {
            h.step();
        }

        if h.metrics.max_clusters >= crowd {
            h.fail(format!("{} peers produced {} clusters", crowd, h.metrics.max_clusters));
        }
        h.check_unchanged_frame();
        h
    }
}

/// One engine, one surface, one oracle, one virtual clock.
struct Harness {
    context: SimContext,
    engine: Engine,
    surface: RecordingSurface,
    oracle: PeerOracle,
    metrics: ScenarioMetrics,
    violations: Vec<String>,
    ticks: u64,
    tick_ms: i64,
}

impl Harness {
    fn new(
        seed: u64,
        config: EngineConfig,
        oracle: PeerOracle,
        surface: RecordingSurface,
        tick_ms: i64,
    ) -> Self {
        Self {
            context: SimContext::new(seed),
            engine: Engine::new(config),
            surface,
            oracle,
            metrics: ScenarioMetrics::default(),
            violations: Vec::new(),
            ticks: 0,
            tick_ms,
        }
    }

    fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    fn now(&self) -> Timestamp {
        self.context.now_millis()
    }

    fn fail(&mut self, reason: String) {
        warn!("invariant violated: {}", reason);
        self.violations.push(reason);
    }

    fn set_viewer(&mut self, position: Option<Position>) {
        if let Err(e) = self.engine.set_viewer_position(position) {
            self.fail(format!("viewer rejected: {}", e));
        }
    }

    fn set_viewport(&mut self, zoom: f64, center: Position) {
        if let Err(e) = self.engine.set_viewport(zoom, center) {
            self.fail(format!("viewport rejected: {}", e));
        }
    }

    fn advance(&mut self) {
        self.context
            .advance_time(Duration::from_millis(self.tick_ms as u64));
        self.ticks += 1;
    }

    fn send_reports(&mut self) {
        let reports = self.oracle.reports(self.now());
        self.metrics.reports_sent += reports.len() as u64;
        self.engine.submit_peer_reports(reports);
    }

    /// One simulation step: move, report, run whatever is due, advance.
    fn step(&mut self) {
        self.oracle.step(self.tick_ms);
        self.send_reports();
        self.drive();
        self.advance();
    }

    /// Runs every due pass and animation tick at the current time.
    fn drive(&mut self) {
        let now = self.now();
        while let Some(batch) = self.engine.poll(now) {
            self.apply(batch);
        }
    }

    /// Lets every animation finish without new telemetry.
    fn settle(&mut self) {
        let lifecycle = &self.config().lifecycle;
        let longest = lifecycle.stagger_cap_ms
            + lifecycle.appear_ms.max(lifecycle.move_ms).max(lifecycle.disappear_ms);
        let steps = (longest as i64 / self.tick_ms) + 2;
        for _ in 0..steps {
            self.advance();
            self.drive();
        }
        if let Some(deadline) = self.engine.next_deadline() {
            self.fail(format!("animation still pending at {} after settling", deadline));
        }
    }

    /// Settles, then checks that a pass over the same world emits nothing.
    fn check_unchanged_frame(&mut self) {
        self.settle();
        if self.engine.has_pending_work() {
            return;
        }
        let now = self.now();
        let batch = self.engine.run_pass(now);
        if !batch.is_empty() {
            self.fail(format!("unchanged frame emitted {} commands", batch.len()));
            self.apply(batch);
        }
    }

    fn apply(&mut self, batch: RenderBatch) {
        let cap = self.config().lifecycle.stagger_cap_ms;
        for placement in batch.placements(VisualPhase::Appearing) {
            if placement.delay_ms > cap {
                let reason = format!(
                    "{} appears after {} ms (cap {})",
                    placement.id, placement.delay_ms, cap
                );
                self.violations.push(reason);
            }
        }

        self.metrics.commands += batch.len() as u64;
        self.metrics.appearing += batch.placements(VisualPhase::Appearing).count() as u64;
        self.metrics.moving += batch.placements(VisualPhase::Moving).count() as u64;
        self.metrics.disappearing += batch.placements(VisualPhase::Disappearing).count() as u64;
        self.metrics.removed_markers += batch.removals().count() as u64;

        self.engine.flush(&batch, &mut self.surface);
        self.check_engine();
    }

    /// Each placeable live peer in exactly one cluster; finite centroids.
    fn check_engine(&mut self) {
        self.metrics.invariant_checks += 1;

        let mut seen: HashMap<PeerId, usize> = HashMap::new();
        let mut problems = Vec::new();
        for cluster in self.engine.clusters() {
            if !cluster.centroid.lat.is_finite() || !cluster.centroid.lng.is_finite() {
                problems.push(format!("cluster {:?} has a non-finite centroid", cluster.key));
            }
            for member in &cluster.members {
                *seen.entry(*member).or_default() += 1;
            }
        }

        for peer in self.engine.peers() {
            let expected = usize::from(!peer.removed && peer.position().is_some());
            let actual = seen.get(&peer.id()).copied().unwrap_or(0);
            if actual != expected {
                problems.push(format!(
                    "peer {} in {} clusters, expected {}",
                    peer.id(),
                    actual,
                    expected
                ));
            }
        }
        for id in seen.keys() {
            if self.engine.peer(id).is_none() {
                problems.push(format!("cluster member {} is not tracked", id));
            }
        }
        for problem in problems {
            self.fail(problem);
        }

        let clusters = self.engine.clusters().len();
        if clusters > 0 {
            self.metrics.max_clusters = self.metrics.max_clusters.max(clusters);
            self.metrics.min_clusters = Some(self.metrics.min_clusters.map_or(clusters, |m| m.min(clusters)));
        }
    }

    fn finish(mut self, scenario: ScenarioId, seed: u64) -> ScenarioResult {
        if self.engine.has_pending_work() {
            let now = self.now();
            let batch = self.engine.run_pass(now);
            self.apply(batch);
        }

        let stats = self.engine.stats();
        self.metrics.reports_accepted = stats.reports_accepted;
        self.metrics.reports_throttled = stats.reports_throttled;
        self.metrics.reports_invalid = stats.reports_invalid;
        self.metrics.passes = stats.passes;
        self.metrics.render_failures = stats.render_failures;

        let accounted = stats.reports_accepted + stats.reports_throttled + stats.reports_invalid;
        if accounted != self.metrics.reports_sent {
            self.fail(format!(
                "{} reports sent, {} accounted for",
                self.metrics.reports_sent, accounted
            ));
        }

        let mut violations = std::mem::take(&mut self.violations);
        violations.extend(self.surface.violations().iter().cloned());

        let failure_reason = match violations.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            [first, rest @ ..] => Some(format!("{} (+{} more)", first, rest.len())),
        };

        debug!(
            "  {} passes, {} commands, {} clusters max",
            self.metrics.passes, self.metrics.commands, self.metrics.max_clusters
        );

        ScenarioResult {
            scenario,
            seed,
            passed: failure_reason.is_none(),
            total_ticks: self.ticks,
            final_time_secs: self.context.now().as_secs_f64(),
            final_peer_count: stats.tracked_peers,
            failure_reason,
            metrics: self.metrics,
        }
    }
}
