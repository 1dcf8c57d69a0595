//! Validation Module - Input Sanity Checks for Peer Telemetry
//! ===========================================================
//!
//! Every report is checked here before it can reach the throttle, the
//! calculator or the clusterer. A report that fails is dropped on its own;
//! the peer keeps whatever state it had before.
//!
//! Checks:
//! - Coordinates are finite (no NaN / infinity)
//! - Latitude within [-90, 90], longitude within [-180, 180]
//! - Accuracy, when present, is finite and non-negative

use nearby_env::{PeerReport, Position};
use thiserror::Error;

/// Why a position or report was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Non-finite coordinate: lat={lat}, lng={lng}")]
    NonFiniteCoordinate { lat: f64, lng: f64 },

    #[error("Latitude out of range: {0}")]
    LatitudeOutOfRange(f64),

    #[error("Longitude out of range: {0}")]
    LongitudeOutOfRange(f64),

    #[error("Accuracy must be a non-negative number of meters: {0}")]
    NegativeAccuracy(f64),
}

/// Checks that a position is a usable WGS84 coordinate.
pub fn validate_position(position: &Position) -> Result<(), ValidationError> {
    if !position.lat.is_finite() || !position.lng.is_finite() {
        return Err(ValidationError::NonFiniteCoordinate {
            lat: position.lat,
            lng: position.lng,
        });
    }
    if !(-90.0..=90.0).contains(&position.lat) {
        return Err(ValidationError::LatitudeOutOfRange(position.lat));
    }
    if !(-180.0..=180.0).contains(&position.lng) {
        return Err(ValidationError::LongitudeOutOfRange(position.lng));
    }
    Ok(())
}

/// Checks a full report. A missing position is valid (the peer is tracked
/// but not placed on the map).
pub fn validate_report(report: &PeerReport) -> Result<(), ValidationError> {
    if let Some(position) = &report.position {
        validate_position(position)?;
    }
    if let Some(accuracy) = report.accuracy_m {
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(ValidationError::NegativeAccuracy(accuracy));
        }
    }
    Ok(())
}
