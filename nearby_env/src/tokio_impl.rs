//! Production implementation of NearbyContext using Tokio.

use crate::NearbyContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Production context backed by Tokio and the system clock.
///
/// Wall-clock time is read once at construction and then advanced by the
/// monotonic clock. Animation deadlines and the clustering debounce are
/// wall-clock millis, so an NTP step backwards must not stall them.
pub struct TokioContext {
    /// Monotonic reference taken at construction
    start: Instant,

    /// Wall-clock time at `start`
    origin: SystemTime,
}

impl TokioContext {
    /// Creates a new TokioContext anchored at the current system time.
    pub fn new() -> Self {
        Self::anchored_at(SystemTime::now())
    }

    /// Creates a context whose wall clock starts at `origin`.
    pub fn anchored_at(origin: SystemTime) -> Self {
        Self {
            start: Instant::now(),
            origin,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NearbyContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.origin + self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn seed(&self) -> u64 {
        0
    }
}
