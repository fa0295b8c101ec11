//! Guide Camera Acquisition Layer
//!
//! Drives the guide cameras used at both observatories through one async
//! interface.
//!
//! ## Features
//!
//! - Unified camera trait over the Apogee Alta and Andor Ikon heads
//! - Simulated backend with fault injection for development and tests
//! - Exposure state machine: start, integrate, poll, fetch, classify
//! - Bounded polling so a wedged acquisition flag becomes a timeout
//! - Connection health tracking with fail-fast on every operation
//! - Cooler management and warm-up-before-power-off shutdown
//! - Typed errors carrying the vendor call name and numeric code

mod controller;
mod cooler;
mod error;
mod traits;
pub mod vendor;

pub use controller::{
    CameraController, ConnectionState, ExposureProgress, ProgressSink, RawExposure,
    DEFAULT_SAFE_TEMP_DEGC,
};
pub use cooler::{CoolerState, CoolerStatus};
pub use error::{CameraError, CameraResult};
pub use traits::{
    AcquisitionState, FrameClass, GuideCamera, ImageFrame, ReadoutFormat, TimeoutConfig,
};
pub use vendor::{camera_for_site, Site};
