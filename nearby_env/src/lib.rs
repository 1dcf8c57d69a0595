//! Nearby Environment Abstraction Layer
//!
//! This crate provides the shared vocabulary and the "Sans-IO" seams that let
//! the Nearby engine run in both **Production** (tokio) and **Simulation**
//! (virtual clock) environments.
//!
//! # Core Concept
//!
//! The engine never touches a clock, a timer, a map widget or a telemetry
//! socket directly. It talks to:
//! - [`NearbyContext`] for time (`now()`, `system_time()`, `sleep()`)
//! - [`RenderSurface`] for marker placement commands
//! - [`TelemetrySource`] for incoming location reports
//!
//! # Example
//!
//! ```ignore
//! use nearby_env::{NearbyContext, TelemetrySource};
//!
//! async fn pump<Ctx: NearbyContext, Src: TelemetrySource>(ctx: &Ctx, src: &Src) {
//!     loop {
//!         tokio::select! {
//!             event = src.recv() => handle(event),
//!             _ = ctx.sleep(Duration::from_millis(32)) => tick(),
//!         }
//!     }
//! }
//! ```

mod context;
mod surface;
mod types;
mod error;
mod tokio_impl;

pub use context::NearbyContext;
pub use surface::{
    MarkerPlacement, RenderCommand, RenderSurface, TelemetryEvent, TelemetrySource, VisualPhase,
};
pub use types::{ClusterId, MarkerId, PeerId, PeerReport, Position, Timestamp};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
