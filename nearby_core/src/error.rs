//! Error types for the Nearby engine.

use nearby_env::EnvError;
use thiserror::Error;

use crate::validation::ValidationError;

/// Errors surfaced by the engine facade and its runtime.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Invalid zoom level: {0}")]
    InvalidZoom(f64),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Engine runtime has stopped")]
    RuntimeStopped,
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}
