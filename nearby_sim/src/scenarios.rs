//! Deterministic engine scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: every peer arrives in a single telemetry batch
    BurstArrival,

    /// SIM-002: stationary peers with GPS jitter and malformed reports
    NoisyTelemetry,

    /// SIM-003: zoom from street level to continent and back
    ZoomSweep,

    /// SIM-004: half the peers stop sharing mid-run
    Unfriend,

    /// SIM-005: rendering surface rejects a share of commands
    FlakySurface,

    /// SIM-006: more peers than the clustering cutoff at street zoom
    Crowd,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::BurstArrival,
            ScenarioId::NoisyTelemetry,
            ScenarioId::ZoomSweep,
            ScenarioId::Unfriend,
            ScenarioId::FlakySurface,
            ScenarioId::Crowd,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::BurstArrival => "burst_arrival",
            ScenarioId::NoisyTelemetry => "noisy_telemetry",
            ScenarioId::ZoomSweep => "zoom_sweep",
            ScenarioId::Unfriend => "unfriend",
            ScenarioId::FlakySurface => "flaky_surface",
            ScenarioId::Crowd => "crowd",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::BurstArrival => "All peers in one batch, staggered appearance within the cap",
            ScenarioId::NoisyTelemetry => "GPS jitter below the movement epsilon plus NaN reports",
            ScenarioId::ZoomSweep => "Zoom 18 to 3 and back, clusters form and split",
            ScenarioId::Unfriend => "Half the peers removed, every marker disappears before removal",
            ScenarioId::FlakySurface => "20% of render commands fail, engine state stays consistent",
            ScenarioId::Crowd => "Peer count above the cutoff forces clustering at street zoom",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "burst_arrival" | "burst" | "sim-001" => Ok(ScenarioId::BurstArrival),
            "noisy_telemetry" | "noisy" | "sim-002" => Ok(ScenarioId::NoisyTelemetry),
            "zoom_sweep" | "zoom" | "sim-003" => Ok(ScenarioId::ZoomSweep),
            "unfriend" | "sim-004" => Ok(ScenarioId::Unfriend),
            "flaky_surface" | "flaky" | "sim-005" => Ok(ScenarioId::FlakySurface),
            "crowd" | "sim-006" => Ok(ScenarioId::Crowd),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("SIM-003".parse::<ScenarioId>(), Ok(ScenarioId::ZoomSweep));
        assert_eq!("Flaky".parse::<ScenarioId>(), Ok(ScenarioId::FlakySurface));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }
}
