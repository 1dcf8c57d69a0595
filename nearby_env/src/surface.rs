//! Collaborator interfaces: the telemetry feed in, the rendering surface out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EnvError;
use crate::types::{MarkerId, PeerId, PeerReport, Position};

/// Animation phase of a rendered marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VisualPhase {
    Idle,
    Appearing,
    Moving,
    Disappearing,
}

/// A single `renderMarker` instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerPlacement {
    /// Marker being placed
    pub id: MarkerId,

    /// Target position once the animation completes
    pub position: Position,

    /// Start position for a MOVING animation
    pub from: Option<Position>,

    /// Phase the marker enters with this command
    pub phase: VisualPhase,

    /// Number of peers behind the marker (clusters only)
    pub member_count: Option<usize>,

    /// Number of online peers behind the marker (clusters only)
    pub online_count: Option<usize>,

    /// Delay before the animation starts (stagger), in milliseconds
    pub delay_ms: u64,

    /// Animation length in milliseconds
    pub duration_ms: u64,
}

impl MarkerPlacement {
    pub fn is_cluster(&self) -> bool {
        self.id.is_cluster()
    }
}

/// One entry of an ordered render batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RenderCommand {
    Render(MarkerPlacement),
    Remove(MarkerId),
}

impl RenderCommand {
    pub fn marker_id(&self) -> MarkerId {
        match self {
            RenderCommand::Render(placement) => placement.id,
            RenderCommand::Remove(id) => *id,
        }
    }
}

/// The map layer that draws markers.
///
/// # Implementations
///
/// - **Production**: bridges to the platform map widget
/// - **Simulation**: records commands and injects failures
///
/// A failing call affects only that marker; callers keep applying the rest
/// of the batch.
pub trait RenderSurface: Send {
    /// Places or updates a marker.
    fn render_marker(&mut self, placement: &MarkerPlacement) -> Result<(), EnvError>;

    /// Removes a marker from the map.
    fn remove_marker(&mut self, id: MarkerId) -> Result<(), EnvError>;
}

/// Something the telemetry source pushes at the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A batch of fresh location reports
    Reports(Vec<PeerReport>),
    /// Peer was unfriended or stopped sharing
    Removed(PeerId),
}

/// Push-based source of peer telemetry.
///
/// # Packet Flow
///
/// ```text
/// Source                     Runtime                    Engine
///   |-- recv() -> event ------->|                          |
///   |                           |-- queue + coalesce ----->|
/// ```
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    /// Receives the next event.
    ///
    /// # Returns
    /// * `Some(event)` - Reports or a removal arrived
    /// * `None` - The source closed (shutdown)
    async fn recv(&self) -> Option<TelemetryEvent>;
}
