//! Guide Camera Exposure Sequencing
//!
//! Turns user-level exposure commands into hardware captures and FITS
//! files on disk.
//!
//! ## Features
//! - Night-directory path resolution with the SDSS MJD rollover
//! - Nearest-prior dark/flat lookup from on-disk sidecar records
//! - Calibration policy with a force override for engineering use
//! - Median stacking of repeated captures
//! - Replay of previously recorded nights without touching hardware

mod calibration;
mod error;
mod paths;
mod sequencer;
mod stacking;

pub use calibration::{
    dark_sidecar_name, find_dark_and_flat, find_most_recent, flat_sidecar_name,
    write_dark_sidecar, write_flat_sidecar, CalibrationMatch, NO_CARTRIDGE,
};
pub use error::{SequencerError, SequencerResult};
pub use paths::{
    current_night_mjd, ensure_night_dir, frame_filename, frame_path, night_mjd, next_seqno,
    parse_frame_seqno, SimulationCursor, FRAME_PREFIX,
};
pub use sequencer::{
    CalibrationCache, ExposureKind, ExposureRequest, ExposureResult, ExposureSequencer,
    SimulationStatus,
};
pub use stacking::median_combine;
