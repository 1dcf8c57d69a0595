//! Nearby Deterministic Simulation Harness
//!
//! This crate provides a controlled environment where the Nearby engine runs
//! against a simulated neighbourhood, deterministically.
//!
//! # Core Principle: Everything Is Seeded
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advanced in fixed steps
//! - **Peers**: Positions, movement and noise derived from a single 64-bit seed
//! - **Rendering**: Injected surface failures drawn from the same seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock)                           │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                                                     │
//! │  ┌────▼──────┐   PeerReport    ┌─────────┐  RenderCommand   │
//! │  │PeerOracle │ ──────────────► │ Engine  │ ───────────────► │
//! │  │(truth)    │                 └─────────┘  RecordingSurface│
//! │  └───────────┘                                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nearby_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42, 40).with_duration(10.0);
//! let result = runner.run(ScenarioId::ZoomSweep);
//! assert!(result.passed);
//! ```

mod context;
mod oracle;
mod runner;
mod surface;
pub mod scenarios;

pub use context::SimContext;
pub use oracle::{offset_position, PeerOracle, SimPeer};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, HOME};
pub use surface::RecordingSurface;
