//! Camera controller: the exposure state machine.
//!
//! Owns exactly one [`GuideCamera`] and serializes all hardware access
//! through it. Responsibilities:
//!
//! - Connection health: one `ok` flag plus the last error message. Every
//!   operation checks the flag first and fails fast while it is down.
//! - The capture sequence: start, integrate, poll, fetch, classify, with
//!   progress reports to an attached sink.
//! - Cooler management and the warm-up-before-power-off shutdown sequence.
//! - Error normalization: vendor failures surface as [`CameraError`] and
//!   drop the connection flag so the operator knows a reconnect is needed.

use crate::cooler::CoolerState;
use crate::error::{CameraError, CameraResult};
use crate::traits::{AcquisitionState, FrameClass, GuideCamera, ImageFrame, ReadoutFormat, TimeoutConfig};
use serde::Serialize;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, RwLock};

// =============================================================================
// TIMING CONSTANTS
// =============================================================================

/// Exposures at or below this skip the bulk sleep and go straight to
/// polling; sleeping through a very short exposure overshoots it.
const EXPOSE_WAIT_THRESHOLD_SECS: f64 = 0.25;

/// How early the bulk sleep wakes, leaving the tail to the poll loop.
const EXPOSE_SLEEP_MARGIN_SECS: f64 = 0.2;

/// The CCD counts as warm enough for power-off within this many degC of
/// the safe threshold.
const WARMUP_TOLERANCE_DEGC: f64 = 0.5;

/// Default CCD temperature at or above which power-off is safe.
pub const DEFAULT_SAFE_TEMP_DEGC: f64 = 0.0;

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// Health of the hardware link.
///
/// `ok` drops on any hardware failure and is restored only by an explicit
/// reconnect. `last_error` keeps the message that dropped it, so a status
/// query long after the fault still explains what happened.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionState {
    pub ok: bool,
    pub last_error: Option<String>,
}

// =============================================================================
// PROGRESS REPORTING
// =============================================================================

/// One step of an exposure as reported to the command layer.
///
/// Values mirror the actor keyword dictionary: a state name plus remaining
/// and total seconds for that state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ExposureProgress {
    Idle,
    Integrating { remaining_secs: f64, total_secs: f64 },
    Reading { remaining_secs: f64, total_secs: f64 },
    Done,
    Failed,
}

impl ExposureProgress {
    /// Render the `exposureState` keyword value:
    /// `"<state>",<remaining>,<total>`.
    pub fn keyword_value(&self) -> String {
        match self {
            ExposureProgress::Idle => "\"idle\",0.0,0.0".to_string(),
            ExposureProgress::Integrating { remaining_secs, total_secs } => {
                format!("\"integrating\",{:.1},{:.1}", remaining_secs, total_secs)
            }
            ExposureProgress::Reading { remaining_secs, total_secs } => {
                format!("\"reading\",{:.1},{:.1}", remaining_secs, total_secs)
            }
            ExposureProgress::Done => "\"done\",0.0,0.0".to_string(),
            ExposureProgress::Failed => "\"failed\",0.0,0.0".to_string(),
        }
    }
}

/// Receives side-effect notifications while the controller works.
///
/// The command layer implements this to forward keywords to the commander;
/// tests implement it to record the sequence of states.
pub trait ProgressSink: Send + Sync {
    fn exposure_state(&self, progress: ExposureProgress);

    /// Intermediate cooler readings during the shutdown warm-up loop.
    fn cooler_reading(&self, _state: &CoolerState) {}

    /// Operator-visible warnings that should not abort the operation.
    fn warning(&self, _text: &str) {}
}

// =============================================================================
// CAPTURE RESULT
// =============================================================================

/// Everything one hardware capture produced, before the sequencer attaches
/// calibration and stacking metadata.
#[derive(Debug, Clone)]
pub struct RawExposure {
    pub frame: ImageFrame,
    pub itime: f64,
    /// Wall-clock start of integration, for the DATE-OBS header.
    pub start: SystemTime,
    pub class: FrameClass,
    /// CCD temperature at readout, from the freshest reading available.
    pub ccd_temp: f64,
    pub bin: (u32, u32),
    pub window_origin: (u32, u32),
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Owns one guide camera and runs its exposure state machine.
///
/// The camera sits behind a mutex that doubles as the capture slot: a
/// capture holds it for the full integration plus readout, and a second
/// capture request fails with `ExposureInProgress` instead of queueing.
/// Status queries stay responsive during an exposure by serving cached
/// state.
pub struct CameraController {
    name: String,
    camera: Mutex<Box<dyn GuideCamera>>,
    connection: RwLock<ConnectionState>,
    cooler: RwLock<CoolerState>,
    format: RwLock<ReadoutFormat>,
    timeouts: TimeoutConfig,
    safe_temp: f64,
}

impl CameraController {
    /// Wrap a camera. The caller is expected to call [`connect`] next;
    /// connect failures are absorbed there, not raised.
    ///
    /// [`connect`]: CameraController::connect
    pub fn new(camera: Box<dyn GuideCamera>, timeouts: TimeoutConfig) -> Self {
        Self {
            name: camera.name().to_string(),
            camera: Mutex::new(camera),
            connection: RwLock::new(ConnectionState::default()),
            cooler: RwLock::new(CoolerState::default()),
            format: RwLock::new(ReadoutFormat::guide()),
            timeouts,
            safe_temp: DEFAULT_SAFE_TEMP_DEGC,
        }
    }

    /// Override the safe power-off temperature (degC).
    pub fn with_safe_temp(mut self, safe_temp: f64) -> Self {
        self.safe_temp = safe_temp;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current connection health (cached, never touches hardware).
    pub async fn connection(&self) -> ConnectionState {
        self.connection.read().await.clone()
    }

    /// Last cooler reading without touching hardware.
    pub async fn cooler_cache(&self) -> CoolerState {
        *self.cooler.read().await
    }

    /// The readout format most recently programmed.
    pub async fn current_format(&self) -> ReadoutFormat {
        *self.format.read().await
    }

    // =========================================================================
    // CONNECTION MANAGEMENT
    // =========================================================================

    /// Attempt the hardware handshake, absorbing any failure into the
    /// connection state. Never raises: callers inspect the returned state
    /// and report it however they see fit.
    pub async fn connect(&self) -> ConnectionState {
        let mut camera = self.camera.lock().await;
        match camera.connect().await {
            Ok(()) => {
                tracing::info!(camera = %self.name, "camera connected");
                let mut conn = self.connection.write().await;
                conn.ok = true;
                conn.last_error = None;
            }
            Err(e) => {
                tracing::warn!(camera = %self.name, error = %e, "camera connect failed");
                let mut conn = self.connection.write().await;
                conn.ok = false;
                conn.last_error = Some(e.to_string());
            }
        }
        self.connection.read().await.clone()
    }

    /// Tear down and redo the handshake. Waits for an in-flight capture to
    /// drain first; the handle is never recycled mid-integration.
    pub async fn reconnect(&self) -> ConnectionState {
        {
            let mut camera = self.camera.lock().await;
            if let Err(e) = camera.disconnect().await {
                tracing::debug!(camera = %self.name, error = %e, "disconnect before reconnect failed");
            }
        }
        self.connect().await
    }

    /// Fail fast with `ConnectionDown` if the link is flagged down.
    /// First step of every hardware operation.
    async fn require_connected(&self) -> CameraResult<()> {
        let conn = self.connection.read().await;
        if conn.ok {
            Ok(())
        } else {
            Err(CameraError::ConnectionDown {
                camera: self.name.clone(),
                last_error: conn.last_error.clone(),
            })
        }
    }

    /// Record a hardware failure: drop the flag, keep the message.
    async fn note_failure(&self, err: &CameraError) {
        if !marks_connection_down(err) {
            return;
        }
        tracing::error!(camera = %self.name, error = %err, "hardware failure, flagging connection down");
        let mut conn = self.connection.write().await;
        conn.ok = false;
        conn.last_error = Some(err.to_string());
    }

    // =========================================================================
    // COOLER MANAGEMENT
    // =========================================================================

    /// Program the cooler setpoint (`None` turns the cooler off) and
    /// return the refreshed state.
    pub async fn set_cooler_setpoint(&self, setpoint: Option<f64>) -> CameraResult<CoolerState> {
        self.require_connected().await?;
        let mut camera = self.camera.lock().await;

        if let Err(e) = camera.set_cooler(setpoint).await {
            self.note_failure(&e).await;
            return Err(e);
        }
        tracing::info!(camera = %self.name, setpoint = ?setpoint, "cooler setpoint programmed");

        self.refresh_cooler(camera.as_mut()).await
    }

    /// Refresh all cooler fields from hardware.
    ///
    /// While a capture holds the camera this serves the cached reading
    /// instead of blocking for the rest of the integration.
    pub async fn read_cooler_status(&self) -> CameraResult<CoolerState> {
        self.require_connected().await?;
        let mut camera = match self.camera.try_lock() {
            Ok(camera) => camera,
            Err(_) => return Ok(*self.cooler.read().await),
        };
        self.refresh_cooler(camera.as_mut()).await
    }

    async fn refresh_cooler(&self, camera: &mut dyn GuideCamera) -> CameraResult<CoolerState> {
        match camera.read_cooler().await {
            Ok(state) => {
                *self.cooler.write().await = state;
                Ok(state)
            }
            Err(e) => {
                self.note_failure(&e).await;
                Err(e)
            }
        }
    }

    // =========================================================================
    // FORMAT PROGRAMMING
    // =========================================================================

    /// Program a complete readout format (window, overscan, binning).
    pub async fn set_format(&self, format: ReadoutFormat) -> CameraResult<()> {
        self.require_connected().await?;
        let mut camera = self.camera.lock().await;
        if let Err(e) = camera.apply_format(&format).await {
            self.note_failure(&e).await;
            return Err(e);
        }
        *self.format.write().await = format;
        Ok(())
    }

    /// Change binning only, keeping the current window. `y` defaults to `x`.
    pub async fn set_binning(&self, x: u32, y: Option<u32>) -> CameraResult<()> {
        let y = y.unwrap_or(x);
        if x == 0 || y == 0 {
            return Err(CameraError::InvalidParameter(format!(
                "binning must be nonzero, got {}x{}",
                x, y
            )));
        }
        let mut format = *self.format.read().await;
        format.bin_x = x;
        format.bin_y = y;
        self.set_format(format).await
    }

    /// Change the readout window only, keeping binning and overscan.
    pub async fn set_window(
        &self,
        origin_x: u32,
        origin_y: u32,
        width: u32,
        height: u32,
    ) -> CameraResult<()> {
        if width == 0 || height == 0 {
            return Err(CameraError::InvalidParameter(format!(
                "readout window must be nonempty, got {}x{}",
                width, height
            )));
        }
        let mut format = *self.format.read().await;
        format.origin_x = origin_x;
        format.origin_y = origin_y;
        format.width = width;
        format.height = height;
        self.set_format(format).await
    }

    // =========================================================================
    // CAPTURE
    // =========================================================================

    /// The exposure primitive: one integration, fully fetched, classified.
    ///
    /// Blocks (asynchronously) for the whole integration plus readout.
    /// At most one capture runs at a time; a concurrent call fails with
    /// `ExposureInProgress`. On any failure the sink sees `Failed`, the
    /// connection is flagged down, and the error propagates to the caller,
    /// who decides recovery.
    pub async fn capture_one(
        &self,
        itime: f64,
        open_shutter: bool,
        sink: &dyn ProgressSink,
    ) -> CameraResult<RawExposure> {
        self.require_connected().await?;
        if !itime.is_finite() || itime < 0.0 {
            return Err(CameraError::InvalidParameter(format!(
                "exposure time must be >= 0, got {}",
                itime
            )));
        }

        let mut camera = self
            .camera
            .try_lock()
            .map_err(|_| CameraError::ExposureInProgress)?;

        let result = self.run_capture(camera.as_mut(), itime, open_shutter, sink).await;
        if let Err(e) = &result {
            sink.exposure_state(ExposureProgress::Failed);
            self.note_failure(e).await;
        }
        result
    }

    async fn run_capture(
        &self,
        camera: &mut dyn GuideCamera,
        itime: f64,
        open_shutter: bool,
        sink: &dyn ProgressSink,
    ) -> CameraResult<RawExposure> {
        let start = SystemTime::now();
        let started = Instant::now();

        camera.start_exposure(itime, open_shutter).await?;
        sink.exposure_state(ExposureProgress::Integrating {
            remaining_secs: itime,
            total_secs: itime,
        });

        // Sleep through the bulk of the integration, then poll the tail.
        if itime > EXPOSE_WAIT_THRESHOLD_SECS {
            tokio::time::sleep(Duration::from_secs_f64(itime - EXPOSE_SLEEP_MARGIN_SECS)).await;
        }

        let ceiling = self.timeouts.ceiling_for(itime);
        loop {
            match camera.acquisition_state().await? {
                AcquisitionState::Fault(code) => {
                    return Err(CameraError::hardware_call("imaging status", code));
                }
                state if state.is_complete() => break,
                _ => {}
            }
            if started.elapsed() > ceiling {
                return Err(CameraError::acquisition_timeout(
                    "exposure completion",
                    started.elapsed(),
                    itime,
                ));
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }

        let read_estimate = camera.read_time_estimate();
        sink.exposure_state(ExposureProgress::Reading {
            remaining_secs: read_estimate,
            total_secs: read_estimate,
        });

        // The first fetch after a long integration occasionally returns
        // nothing on the Alta network driver; one retry clears it.
        let frame = match camera.fetch_image().await {
            Ok(frame) => frame,
            Err(first) => {
                tracing::warn!(camera = %self.name, error = %first, "image fetch failed, retrying once");
                camera.fetch_image().await?
            }
        };

        let class = FrameClass::classify(open_shutter, itime);
        let ccd_temp = match camera.read_cooler().await {
            Ok(state) => {
                *self.cooler.write().await = state;
                state.ccd_temp
            }
            Err(e) => {
                tracing::debug!(camera = %self.name, error = %e, "cooler read after fetch failed, using cached temperature");
                self.cooler.read().await.ccd_temp
            }
        };

        let format = *self.format.read().await;
        tracing::info!(
            camera = %self.name,
            itime,
            open_shutter,
            class = class.as_str(),
            width = frame.width,
            height = frame.height,
            "exposure complete"
        );

        Ok(RawExposure {
            frame,
            itime,
            start,
            class,
            ccd_temp,
            bin: (format.bin_x, format.bin_y),
            window_origin: (format.origin_x, format.origin_y),
        })
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Power the camera off safely: cooler off, wait for the CCD to warm
    /// to the safe threshold, then cut power. A cold CCD must never be
    /// powered off abruptly.
    ///
    /// If the CCD is already at or above the threshold the warm-up loop is
    /// skipped entirely. The wait is bounded; on timeout the power-off is
    /// still issued (the cooler must not be left running) and the timeout
    /// is reported as the error.
    pub async fn shutdown(&self, sink: Option<&dyn ProgressSink>) -> CameraResult<()> {
        self.require_connected().await?;
        let mut camera = self.camera.lock().await;

        if let Err(e) = camera.set_cooler(None).await {
            self.note_failure(&e).await;
            return Err(e);
        }
        tracing::info!(camera = %self.name, safe_temp = self.safe_temp, "cooler off, waiting for CCD warm-up");

        let started = Instant::now();
        let mut timed_out = None;
        loop {
            let state = match camera.read_cooler().await {
                Ok(state) => {
                    *self.cooler.write().await = state;
                    state
                }
                Err(e) => {
                    self.note_failure(&e).await;
                    return Err(e);
                }
            };

            if state.ccd_temp >= self.safe_temp - WARMUP_TOLERANCE_DEGC {
                break;
            }
            if started.elapsed() > self.timeouts.warmup_timeout {
                timed_out = Some(CameraError::WarmupTimeout {
                    waited: started.elapsed(),
                    ccd_temp: state.ccd_temp,
                    safe_temp: self.safe_temp,
                });
                break;
            }

            if let Some(sink) = sink {
                sink.cooler_reading(&state);
            }
            tracing::debug!(camera = %self.name, ccd_temp = state.ccd_temp, "warming toward safe power-off temperature");
            tokio::time::sleep(self.timeouts.warmup_poll_interval).await;
        }

        let off = camera.power_off().await;
        {
            let mut conn = self.connection.write().await;
            conn.ok = false;
            conn.last_error = Some("camera powered off".to_string());
        }

        if let Some(timeout) = timed_out {
            self.note_failure(&timeout).await;
            return Err(timeout);
        }
        off.map_err(|e| {
            tracing::error!(camera = %self.name, error = %e, "power-off failed");
            e
        })?;
        tracing::info!(camera = %self.name, "camera powered off");
        Ok(())
    }
}

/// Which errors drop the connection flag. Policy rejections (busy, bad
/// parameter) leave the link alone; only real hardware trouble downs it.
fn marks_connection_down(err: &CameraError) -> bool {
    matches!(
        err,
        CameraError::HardwareCall { .. }
            | CameraError::AcquisitionTimeout { .. }
            | CameraError::WarmupTimeout { .. }
            | CameraError::SdkNotLoaded(_)
    )
}
