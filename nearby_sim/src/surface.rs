//! Recording rendering surface with failure injection.
//!
//! Every command the engine emits is checked against the marker protocol
//! before the injected failure is decided, so a flaky map never hides an
//! engine bug.

use nearby_env::{EnvError, MarkerId, MarkerPlacement, RenderCommand, RenderSurface, VisualPhase};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

/// An in-memory map that records what the engine asked it to draw.
pub struct RecordingSurface {
    rng: ChaCha8Rng,

    /// Probability that a command fails (default: 0)
    failure_rate: f64,

    /// Last placement per marker, as emitted
    on_map: BTreeMap<MarkerId, MarkerPlacement>,

    /// Full command log
    log: Vec<RenderCommand>,

    /// Protocol violations seen in the command stream
    violations: Vec<String>,

    failures: u64,
}

impl RecordingSurface {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            failure_rate: 0.0,
            on_map: BTreeMap::new(),
            log: Vec::new(),
            violations: Vec::new(),
            failures: 0,
        }
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn check_placement(&mut self, placement: &MarkerPlacement) {
        let positions = std::iter::once(placement.position).chain(placement.from);
        for p in positions {
            if !p.lat.is_finite() || !p.lng.is_finite() {
                self.violations
                    .push(format!("{} rendered at non-finite position", placement.id));
            }
        }
        if placement.is_cluster() && placement.member_count.unwrap_or(0) < 2 {
            self.violations
                .push(format!("{} is a cluster marker with fewer than 2 members", placement.id));
        }
        self.on_map.insert(placement.id, placement.clone());
    }

    fn check_removal(&mut self, id: MarkerId) {
        match self.on_map.remove(&id) {
            Some(last) if last.phase == VisualPhase::Disappearing => {}
            Some(last) => self
                .violations
                .push(format!("{} removed while {:?}", id, last.phase)),
            None => self.violations.push(format!("{} removed but never rendered", id)),
        }
    }

    fn inject_failure(&mut self, id: MarkerId) -> Result<(), EnvError> {
        if self.failure_rate > 0.0 && self.rng.gen_bool(self.failure_rate) {
            self.failures += 1;
            return Err(EnvError::render(id, "injected failure"));
        }
        Ok(())
    }

    pub fn log(&self) -> &[RenderCommand] {
        &self.log
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Markers currently drawn, as far as the command stream says.
    pub fn on_map(&self) -> impl Iterator<Item = &MarkerPlacement> {
        self.on_map.values()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Commands of one phase across the whole log.
    pub fn count_phase(&self, phase: VisualPhase) -> usize {
        self.log
            .iter()
            .filter(|c| matches!(c, RenderCommand::Render(p) if p.phase == phase))
            .count()
    }

    pub fn count_removals(&self) -> usize {
        self.log
            .iter()
            .filter(|c| matches!(c, RenderCommand::Remove(_)))
            .count()
    }
}

impl RenderSurface for RecordingSurface {
    fn render_marker(&mut self, placement: &MarkerPlacement) -> Result<(), EnvError> {
        self.log.push(RenderCommand::Render(placement.clone()));
        self.check_placement(placement);
        self.inject_failure(placement.id)
    }

    fn remove_marker(&mut self, id: MarkerId) -> Result<(), EnvError> {
        self.log.push(RenderCommand::Remove(id));
        self.check_removal(id);
        self.inject_failure(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_env::{PeerId, Position};

    fn placement(phase: VisualPhase) -> MarkerPlacement {
        MarkerPlacement {
            id: MarkerId::Peer(PeerId::from_seed(1)),
            position: Position::new(1.0, 2.0),
            from: None,
            phase,
            member_count: None,
            online_count: None,
            delay_ms: 0,
            duration_ms: 300,
        }
    }

    #[test]
    fn test_remove_after_disappearing_is_clean() {
        let mut surface = RecordingSurface::new(1);
        let p = placement(VisualPhase::Appearing);
        surface.render_marker(&p).unwrap();
        surface.render_marker(&placement(VisualPhase::Disappearing)).unwrap();
        surface.remove_marker(p.id).unwrap();

        assert!(surface.violations().is_empty());
        assert_eq!(surface.on_map().count(), 0);
        assert_eq!(surface.count_removals(), 1);
    }

    #[test]
    fn test_abrupt_removal_flagged() {
        let mut surface = RecordingSurface::new(1);
        let p = placement(VisualPhase::Appearing);
        surface.render_marker(&p).unwrap();
        surface.remove_marker(p.id).unwrap();

        assert_eq!(surface.violations().len(), 1);
    }

    #[test]
    fn test_nan_position_flagged() {
        let mut surface = RecordingSurface::new(1);
        let mut p = placement(VisualPhase::Appearing);
        p.position = Position::new(f64::NAN, 0.0);
        surface.render_marker(&p).unwrap();

        assert_eq!(surface.violations().len(), 1);
    }

    #[test]
    fn test_failure_injection_still_records() {
        let mut surface = RecordingSurface::new(9).with_failure_rate(1.0);
        assert!(surface.render_marker(&placement(VisualPhase::Appearing)).is_err());
        assert_eq!(surface.failures(), 1);
        assert_eq!(surface.log().len(), 1);
    }
}
