//! Error types for the camera layer.
//!
//! Every vendor-specific failure is normalized into [`CameraError`] at the
//! controller boundary; raw SDK codes never cross into the sequencer. Each
//! variant carries enough context to diagnose the failure from a log line
//! alone (which call, which code, how long we waited).

use std::time::Duration;
use thiserror::Error;

/// Result type alias for camera operations.
pub type CameraResult<T> = Result<T, CameraError>;

/// Error type for all camera-layer operations.
#[derive(Error, Debug, Clone)]
pub enum CameraError {
    // =========================================================================
    // Connection Errors
    // =========================================================================

    /// The controller's connection flag is down. Set after any hardware
    /// failure; cleared only by an explicit reconnect.
    #[error("{camera} camera is not connected; last error: {}", .last_error.as_deref().unwrap_or("none"))]
    ConnectionDown {
        camera: String,
        last_error: Option<String>,
    },

    /// The vendor SDK library could not be located or its symbols resolved.
    #[error("camera SDK not available: {0}")]
    SdkNotLoaded(String),

    // =========================================================================
    // Hardware Errors
    // =========================================================================

    /// A vendor SDK call returned a non-success status code.
    /// The message always names the call and the numeric code so the
    /// failure can be looked up in the vendor documentation.
    #[error("hardware call {call} returned error code {code}")]
    HardwareCall { call: String, code: i32 },

    // =========================================================================
    // Timeout Errors
    // =========================================================================

    /// A status poll loop exceeded its ceiling. The reference hardware can
    /// wedge with the acquisition flag stuck busy; the bound converts that
    /// hang into a reportable error.
    #[error("{operation} did not complete within {:.1}s (expected ~{expected_secs:.1}s)", .waited.as_secs_f64())]
    AcquisitionTimeout {
        operation: String,
        waited: Duration,
        expected_secs: f64,
    },

    /// The shutdown warm-up poll exceeded its ceiling before the CCD
    /// reached the safe power-off temperature.
    #[error("CCD still at {ccd_temp:.1}C after {:.0}s warming toward {safe_temp:.1}C", .waited.as_secs_f64())]
    WarmupTimeout {
        waited: Duration,
        ccd_temp: f64,
        safe_temp: f64,
    },

    // =========================================================================
    // Usage Errors
    // =========================================================================

    /// A second capture was requested while one is already in flight.
    /// Captures are rejected rather than queued; the hardware registers are
    /// single-valued and must not be touched mid-exposure.
    #[error("an exposure is already in progress")]
    ExposureInProgress,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl CameraError {
    /// Create a hardware call failure from a vendor status code.
    pub fn hardware_call(call: impl Into<String>, code: i32) -> Self {
        CameraError::HardwareCall {
            call: call.into(),
            code,
        }
    }

    /// Create an acquisition timeout with the expected duration for context.
    pub fn acquisition_timeout(
        operation: impl Into<String>,
        waited: Duration,
        expected_secs: f64,
    ) -> Self {
        CameraError::AcquisitionTimeout {
            operation: operation.into(),
            waited,
            expected_secs,
        }
    }

    /// Returns true if this error is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CameraError::AcquisitionTimeout { .. } | CameraError::WarmupTimeout { .. }
        )
    }

    /// Returns true if a reconnect is expected to clear this error.
    ///
    /// Connection, hardware-call, and timeout failures all leave the
    /// controller flagged down; the operator recovers with `reconnect`.
    /// Usage errors (busy, bad parameter) are not cleared by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CameraError::ConnectionDown { .. }
                | CameraError::SdkNotLoaded(_)
                | CameraError::HardwareCall { .. }
                | CameraError::AcquisitionTimeout { .. }
                | CameraError::WarmupTimeout { .. }
        )
    }
}
