//! Nearby Core - Proximity ranking and spatial clustering for live peer maps
//!
//! This library turns a stream of peer location reports into a ranked nearby
//! list and a flicker-free set of map markers:
//! 1. **Ranking**: great-circle distance, recency and online status folded
//!    into one priority score, plus a coarse proximity bucket
//! 2. **Clustering**: viewport-aware grid grouping (Web-Mercator pixels or H3
//!    hexagons) that switches on when zoomed out or crowded
//! 3. **Lifecycle**: staggered appear / move / disappear animations diffed
//!    against the previous frame
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │  ┌──────────┐ ┌──────────┐ ┌───────────┐ ┌───────────────┐  │
//! │  │ THROTTLE │►│ RANKING  │►│CLUSTERING │►│   LIFECYCLE   │  │
//! │  └──────────┘ └──────────┘ └───────────┘ └───────────────┘  │
//! │          PeerTable (authoritative tracked-peer state)       │
//! └─────────────────────────────────────────────────────────────┘
//!                 ▲                               │
//!          EngineRuntime (tokio)            RenderSurface
//! ```

pub mod clustering;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod ranking;
pub mod runtime;
pub mod throttle;
pub mod tracking;
pub mod validation;

// Re-export key types for convenience
pub use clustering::{Cluster, ClusterConfig, ClusterKey, GridKind, SpatialClusterer};
pub use engine::{Engine, EngineConfig, EngineStats, MarkerActivation, Viewport};
pub use error::EngineError;
pub use lifecycle::{
    apply_batch, ApplyReport, LifecycleConfig, MarkerLifecycle, MarkerVisualState, RenderBatch,
};
pub use ranking::{ProximityBucket, ProximityCalculator, ProximityRecord, RankingConfig};
pub use runtime::{pump, EngineEvent, EngineHandle, EngineRuntime};
pub use throttle::{ThrottleConfig, ThrottleDecision, UpdateThrottle};
pub use tracking::{BucketCounts, PeerTable, TrackedPeer};
pub use validation::{validate_position, validate_report, ValidationError};
