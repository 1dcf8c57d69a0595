//! Error types for the Nearby environment abstraction.

use thiserror::Error;

use crate::types::MarkerId;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// The rendering surface rejected a command for one marker
    #[error("Render failed for {id}: {reason}")]
    RenderFailed { id: MarkerId, reason: String },
}

impl EnvError {
    /// Creates a render failure.
    pub fn render(id: MarkerId, reason: impl Into<String>) -> Self {
        Self::RenderFailed { id, reason: reason.into() }
    }
}
