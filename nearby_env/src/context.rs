//! Core environment context trait for the Nearby engine.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the engine runtime can run
/// in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Simulation**: `SimContext` - manually advanced virtual clock
///
/// # Determinism
///
/// For deterministic simulation, every source of time is controlled by the
/// implementation. Animation timers and the clustering debounce only ever
/// look at these methods.
#[async_trait]
pub trait NearbyContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for report recency and animation
    /// deadlines.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;

    /// Wall-clock time as Unix milliseconds.
    fn now_millis(&self) -> Timestamp {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}
