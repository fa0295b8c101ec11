//! Sequencing error taxonomy.
//!
//! Hardware failures stay `CameraError` all the way up so the command layer
//! can report the original call name and vendor code; this enum adds the
//! policy and replay failures that only exist above the controller.

use gcam_camera::CameraError;
use gcam_imaging::FitsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An object exposure needs prior calibration that does not exist yet.
    /// Raised before any hardware call is made.
    #[error("no {kind} calibration frame found before sequence {seqno}")]
    CalibrationMissing { kind: &'static str, seqno: u32 },

    /// The replay cursor ran past the last recorded frame.
    #[error("Ran off the end of the simulated data")]
    SimulationExhausted,

    #[error("{0}")]
    InvalidRequest(String),
}

pub type SequencerResult<T> = Result<T, SequencerError>;
