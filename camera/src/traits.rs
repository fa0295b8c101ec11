//! Hardware abstraction for guide cameras.
//!
//! Defines the common interface that both vendor backends (Alta, Andor)
//! and the simulated backend implement. The controller only ever talks to
//! this trait; vendor quirks (status codes, register ordering, retry
//! behavior) stay inside the backend modules.

use crate::cooler::CoolerState;
use crate::error::CameraResult;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

// =============================================================================
// TIMEOUT CONFIGURATION
// =============================================================================

/// Configuration for operation timeouts in the camera layer.
///
/// SDK operations can hang indefinitely if hardware becomes unresponsive,
/// and the acquisition-status flag has been observed to wedge busy. Every
/// polling loop in the controller takes its ceiling from here so a hang
/// becomes a reported timeout instead of a livelock.
///
/// # Default Values
/// - `exposure_poll_timeout`: 60 seconds (caller should derive from the
///   actual exposure via [`TimeoutConfig::for_exposure`])
/// - `fetch_timeout`: 120 seconds (full-frame readout over slow links)
/// - `connect_timeout`: 30 seconds
/// - `warmup_timeout`: 600 seconds (CCD warm-up before power-off)
/// - `poll_interval`: 100 ms
/// - `warmup_poll_interval`: 1 second
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Maximum time to wait for the acquisition flag to report done.
    pub exposure_poll_timeout: Duration,

    /// Maximum time to wait for the pixel buffer transfer.
    pub fetch_timeout: Duration,

    /// Maximum time to wait for the initial hardware handshake.
    pub connect_timeout: Duration,

    /// Maximum time to wait for the CCD to warm to the safe power-off
    /// temperature during shutdown.
    pub warmup_timeout: Duration,

    /// Poll interval for acquisition status checks.
    pub poll_interval: Duration,

    /// Poll interval for the shutdown warm-up loop.
    pub warmup_poll_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            exposure_poll_timeout: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            warmup_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(100),
            warmup_poll_interval: Duration::from_secs(1),
        }
    }
}

impl TimeoutConfig {
    /// Create a timeout config sized for a specific exposure duration.
    ///
    /// The acquisition ceiling is three times the requested integration plus
    /// a fixed margin for readout, with a 60-second floor. Triple the
    /// integration is generous on purpose: a tripped ceiling means the
    /// hardware is wedged, not slow.
    pub fn for_exposure(exposure_secs: f64) -> Self {
        let mut config = Self::default();
        let ceiling = (3.0 * exposure_secs + 60.0).max(60.0);
        config.exposure_poll_timeout = Duration::from_secs_f64(ceiling);
        config
    }

    /// Per-capture acquisition ceiling: the configured poll timeout,
    /// stretched to three times the integration when that is longer.
    /// One controller runs exposures of every length, so the ceiling is
    /// derived per capture rather than baked into the config.
    pub fn ceiling_for(&self, exposure_secs: f64) -> Duration {
        self.exposure_poll_timeout
            .max(Duration::from_secs_f64(3.0 * exposure_secs))
    }
}

// =============================================================================
// FRAME CLASSIFICATION
// =============================================================================

/// What the camera layer can know about a frame from shutter state and
/// integration time alone. Flats look like objects at this level; the
/// sequencer overrides the label when it knows the request was a flat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Shutter open: light reached the CCD.
    Object,
    /// Shutter closed, zero integration: bias/readout-only frame.
    Zero,
    /// Shutter closed, nonzero integration: dark frame.
    Dark,
}

impl FrameClass {
    /// Classify a frame from the capture parameters.
    pub fn classify(open_shutter: bool, itime: f64) -> Self {
        if open_shutter {
            FrameClass::Object
        } else if itime == 0.0 {
            FrameClass::Zero
        } else {
            FrameClass::Dark
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameClass::Object => "object",
            FrameClass::Zero => "zero",
            FrameClass::Dark => "dark",
        }
    }
}

// =============================================================================
// READOUT GEOMETRY
// =============================================================================

/// One complete readout configuration: window, overscan, and binning.
///
/// Only two configurations are ever programmed in operation; both cover the
/// full sensor and differ only in binning. Flats read unbinned so the
/// per-pixel response is not averaged before it is measured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadoutFormat {
    /// Imaging area width in unbinned pixels.
    pub width: u32,
    /// Imaging area height in unbinned pixels.
    pub height: u32,
    /// Overscan columns digitized after each row.
    pub overscan_width: u32,
    /// Overscan rows digitized after the frame.
    pub overscan_height: u32,
    pub bin_x: u32,
    pub bin_y: u32,
    /// Window origin, 1-based as the hardware counts.
    pub origin_x: u32,
    pub origin_y: u32,
    /// Whether overscan pixels are included in the transferred image.
    pub digitize_overscan: bool,
}

impl ReadoutFormat {
    /// Standard binned guiding format.
    pub fn guide() -> Self {
        Self {
            width: 1024,
            height: 1024,
            overscan_width: 24,
            overscan_height: 0,
            bin_x: 2,
            bin_y: 2,
            origin_x: 1,
            origin_y: 1,
            digitize_overscan: true,
        }
    }

    /// Unbinned flat-field format; same window as [`ReadoutFormat::guide`].
    pub fn flat_field() -> Self {
        Self {
            bin_x: 1,
            bin_y: 1,
            ..Self::guide()
        }
    }

    /// Width of the transferred image in binned pixels. The overscan region
    /// is part of the programmed window, so it bins along with the rest.
    pub fn image_width(&self) -> u32 {
        (self.width + self.overscan_width) / self.bin_x
    }

    /// Height of the transferred image in binned pixels.
    pub fn image_height(&self) -> u32 {
        (self.height + self.overscan_height) / self.bin_y
    }
}

// =============================================================================
// ACQUISITION STATE
// =============================================================================

/// Vendor-neutral acquisition status as reported by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No acquisition running; camera flushing or idle, ready to expose.
    Idle,
    /// Integration in progress.
    Exposing,
    /// Integration finished, pixel buffer waiting to be fetched.
    ImageReady,
    /// Hardware reported a fault status code.
    Fault(i32),
}

impl AcquisitionState {
    /// True once the image can be fetched.
    pub fn is_complete(&self) -> bool {
        matches!(self, AcquisitionState::ImageReady | AcquisitionState::Idle)
    }
}

/// A raw frame as fetched from hardware: row-major, unsigned 16-bit.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl ImageFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u16>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height) as usize);
        Self {
            width,
            height,
            pixels,
        }
    }
}

// =============================================================================
// CAMERA TRAIT
// =============================================================================

/// One physical (or simulated) guide camera.
///
/// Implementations translate these operations into vendor SDK calls and
/// normalize every non-success status into
/// [`CameraError::HardwareCall`](crate::CameraError::HardwareCall) carrying
/// the call name and numeric code. No method here blocks for the duration
/// of an integration; waiting is the controller's job.
#[async_trait]
pub trait GuideCamera: Send + Sync + Debug {
    /// Short name used in log lines and error messages ("alta", "andor").
    fn name(&self) -> &str;

    /// True after a successful handshake, until disconnect or power off.
    fn is_connected(&self) -> bool;

    /// Perform the hardware handshake. Retried internally where the vendor
    /// protocol needs it (the Alta network driver often refuses the first
    /// attempt after a power cycle).
    async fn connect(&mut self) -> CameraResult<()>;

    /// Drop the connection without powering the head off.
    async fn disconnect(&mut self) -> CameraResult<()>;

    /// Final power-off. Only called after the CCD has warmed to the safe
    /// threshold; see the controller's shutdown sequence.
    async fn power_off(&mut self) -> CameraResult<()>;

    /// Program window, overscan, and binning registers in one fixed
    /// sequence.
    async fn apply_format(&mut self, format: &ReadoutFormat) -> CameraResult<()>;

    /// Program exposure time and shutter state, then start the acquisition.
    /// Returns as soon as the hardware accepts the command.
    async fn start_exposure(&mut self, itime: f64, open_shutter: bool) -> CameraResult<()>;

    /// Poll the acquisition status once.
    async fn acquisition_state(&mut self) -> CameraResult<AcquisitionState>;

    /// Transfer the pixel buffer for the completed acquisition.
    async fn fetch_image(&mut self) -> CameraResult<ImageFrame>;

    /// Program the cooler. `None` disables it.
    async fn set_cooler(&mut self, setpoint: Option<f64>) -> CameraResult<()>;

    /// Read the full cooler state from hardware.
    async fn read_cooler(&mut self) -> CameraResult<CoolerState>;

    /// Estimated readout duration, used for progress reporting and fetch
    /// deadlines.
    fn read_time_estimate(&self) -> f64 {
        2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_follows_shutter_and_itime() {
        assert_eq!(FrameClass::classify(true, 5.0), FrameClass::Object);
        assert_eq!(FrameClass::classify(true, 0.0), FrameClass::Object);
        assert_eq!(FrameClass::classify(false, 0.0), FrameClass::Zero);
        assert_eq!(FrameClass::classify(false, 1.5), FrameClass::Dark);
    }

    #[test]
    fn for_exposure_scales_ceiling() {
        let instant = TimeoutConfig::for_exposure(0.0);
        assert_eq!(
            instant.exposure_poll_timeout,
            Duration::from_secs(60),
            "zero-length exposures keep the fixed margin"
        );

        let long = TimeoutConfig::for_exposure(100.0);
        assert_eq!(
            long.exposure_poll_timeout,
            Duration::from_secs_f64(360.0),
            "ceiling is 3x exposure plus margin"
        );
    }

    #[test]
    fn per_capture_ceiling_stretches_with_integration() {
        let config = TimeoutConfig::default();
        assert_eq!(
            config.ceiling_for(1.0),
            Duration::from_secs(60),
            "short exposures use the configured timeout"
        );
        assert_eq!(
            config.ceiling_for(100.0),
            Duration::from_secs_f64(300.0),
            "long exposures stretch to 3x the integration"
        );
    }

    #[test]
    fn guide_format_geometry() {
        let guide = ReadoutFormat::guide();
        assert_eq!(guide.image_width(), 524, "(1024+24)/2 binned columns");
        assert_eq!(guide.image_height(), 512);

        let flat = ReadoutFormat::flat_field();
        assert_eq!(flat.bin_x, 1);
        assert_eq!(flat.image_width(), 1048, "unbinned window plus overscan");
        assert_eq!(flat.image_height(), 1024);
    }
}
