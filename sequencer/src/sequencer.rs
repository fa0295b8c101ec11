//! The exposure sequencer.
//!
//! Turns one user-level exposure request into hardware captures and a FITS
//! file on disk:
//!
//! 1. Resolve the output path (next frame in tonight's directory, or the
//!    replay cursor while simulating).
//! 2. Resolve calibration policy: object frames must have a prior dark and
//!    flat on hand unless the request forces past that.
//! 3. Capture, once or `stack` times, switching to the flat readout
//!    geometry for flats and restoring it afterwards.
//! 4. Median-combine stacked captures.
//! 5. Write the FITS file, then the calibration sidecar for darks/flats.
//!    Sidecars land only after the frame itself is safely on disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use gcam_camera::{
    CameraController, CameraError, ExposureProgress, FrameClass, ImageFrame, ProgressSink,
    RawExposure, ReadoutFormat,
};
use gcam_imaging::{write_u16_fits, FitsHeader};

use crate::calibration::{
    find_dark_and_flat, write_dark_sidecar, write_flat_sidecar, NO_CARTRIDGE,
};
use crate::error::{SequencerError, SequencerResult};
use crate::paths::{
    ensure_night_dir, frame_path, next_seqno, parse_frame_seqno, SimulationCursor,
};
use crate::stacking::median_combine;

// =============================================================================
// REQUEST / RESULT TYPES
// =============================================================================

/// What the operator asked for.
///
/// Distinct from the shutter-derived frame class: a flat is an open-shutter
/// capture that additionally binds a cartridge and a readout geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureKind {
    Object,
    Dark,
    Flat,
    /// Zero-length closed-shutter readout; tagged `zero` like the hardware
    /// frame class.
    Bias,
}

impl ExposureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureKind::Object => "object",
            ExposureKind::Dark => "dark",
            ExposureKind::Flat => "flat",
            ExposureKind::Bias => "bias",
        }
    }

    fn opens_shutter(&self) -> bool {
        !matches!(self, ExposureKind::Dark | ExposureKind::Bias)
    }
}

#[derive(Debug, Clone)]
pub struct ExposureRequest {
    pub kind: ExposureKind,
    pub itime: f64,
    /// Cartridge a flat is taken for. Ignored for other kinds.
    pub cartridge: Option<i32>,
    /// Explicit output path; bypasses night-directory numbering.
    pub filename: Option<PathBuf>,
    /// Number of captures to median-combine. Treated as at least 1.
    pub stack: u32,
    /// Let an object exposure proceed without a prior dark/flat.
    pub force_no_calibration: bool,
}

impl ExposureRequest {
    pub fn object(itime: f64) -> Self {
        Self {
            kind: ExposureKind::Object,
            itime,
            cartridge: None,
            filename: None,
            stack: 1,
            force_no_calibration: false,
        }
    }

    pub fn dark(itime: f64) -> Self {
        Self {
            kind: ExposureKind::Dark,
            ..Self::object(itime)
        }
    }

    pub fn flat(itime: f64) -> Self {
        Self {
            kind: ExposureKind::Flat,
            ..Self::object(itime)
        }
    }

    pub fn bias() -> Self {
        Self {
            kind: ExposureKind::Bias,
            ..Self::object(0.0)
        }
    }
}

/// Everything one completed request produced.
#[derive(Debug, Clone)]
pub struct ExposureResult {
    pub path: PathBuf,
    pub seqno: u32,
    pub kind: ExposureKind,
    pub class: FrameClass,
    pub itime: f64,
    pub stack: u32,
    pub effective_itime: f64,
    pub dark_ref: Option<PathBuf>,
    pub flat_ref: Option<PathBuf>,
    pub flat_cartridge: i32,
    /// True when the frame was re-served from a recorded night.
    pub simulated: bool,
}

/// The most recent dark/flat on hand, for status reporting without a
/// directory scan.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationCache {
    pub dark: Option<PathBuf>,
    pub flat: Option<PathBuf>,
    pub cartridge: i32,
}

impl Default for CalibrationCache {
    fn default() -> Self {
        Self {
            dark: None,
            flat: None,
            cartridge: NO_CARTRIDGE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationStatus {
    pub on: bool,
    pub root: Option<PathBuf>,
    pub seqno: u32,
}

/// Replay state. The last root/seqno stick around after disarming so
/// status can still report where the cursor was.
#[derive(Debug)]
struct SimReplay {
    cursor: Option<SimulationCursor>,
    last_root: Option<PathBuf>,
    last_seqno: u32,
}

impl Default for SimReplay {
    fn default() -> Self {
        Self {
            cursor: None,
            last_root: None,
            last_seqno: 1,
        }
    }
}

/// Internal plan for one real capture, fixed before any hardware call.
struct CapturePlan<'a> {
    request: &'a ExposureRequest,
    dir: &'a Path,
    seqno: u32,
    path: &'a Path,
    dark_ref: Option<&'a Path>,
    flat_ref: Option<&'a Path>,
    flat_cartridge: i32,
}

// =============================================================================
// SEQUENCER
// =============================================================================

pub struct ExposureSequencer {
    controller: Arc<CameraController>,
    data_root: PathBuf,
    /// Capture slot for user-level requests, real or replayed. Try-locked:
    /// a second request while one is in flight is rejected, never queued.
    slot: tokio::sync::Mutex<()>,
    sim: Mutex<SimReplay>,
    calibration: RwLock<CalibrationCache>,
}

impl ExposureSequencer {
    pub fn new(controller: Arc<CameraController>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            controller,
            data_root: data_root.into(),
            slot: tokio::sync::Mutex::new(()),
            sim: Mutex::new(SimReplay::default()),
            calibration: RwLock::new(CalibrationCache::default()),
        }
    }

    pub fn controller(&self) -> &CameraController {
        &self.controller
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn calibration_cache(&self) -> CalibrationCache {
        self.calibration.read().unwrap().clone()
    }

    /// Night directory and next frame number, creating the directory on
    /// first use of the night.
    pub fn night_status(&self) -> SequencerResult<(PathBuf, u32)> {
        let dir = ensure_night_dir(&self.data_root)?;
        let seqno = next_seqno(&dir)?;
        Ok((dir, seqno))
    }

    /// Re-scan tonight's sidecars and replace the in-memory calibration
    /// view. The scan is the source of truth; this is how dark/flat linkage
    /// survives a process restart.
    pub fn resync(&self) -> SequencerResult<CalibrationCache> {
        let dir = ensure_night_dir(&self.data_root)?;
        let seqno = next_seqno(&dir)?;
        let found = find_dark_and_flat(&dir, seqno)?;
        let cache = CalibrationCache {
            dark: found.dark,
            flat: found.flat,
            cartridge: found.flat_cartridge,
        };
        *self.calibration.write().unwrap() = cache.clone();
        tracing::info!(dir = %dir.display(), next = seqno, "resynced calibration from disk");
        Ok(cache)
    }

    // =========================================================================
    // SIMULATION REPLAY
    // =========================================================================

    pub fn is_simulating(&self) -> bool {
        self.sim.lock().unwrap().cursor.is_some()
    }

    pub fn simulation_status(&self) -> SimulationStatus {
        let sim = self.sim.lock().unwrap();
        match &sim.cursor {
            Some(cursor) => SimulationStatus {
                on: true,
                root: Some(cursor.root().to_path_buf()),
                seqno: cursor.seqno(),
            },
            None => SimulationStatus {
                on: false,
                root: sim.last_root.clone(),
                seqno: sim.last_seqno,
            },
        }
    }

    /// Arm replay of a recorded night. Fails if the night directory or the
    /// starting frame is missing.
    pub fn simulate_from(&self, night: &str, seqno: u32) -> SequencerResult<SimulationStatus> {
        let cursor = SimulationCursor::arm(&self.data_root, night, seqno)?;
        self.sim.lock().unwrap().cursor = Some(cursor);
        Ok(self.simulation_status())
    }

    pub fn simulate_off(&self) -> SimulationStatus {
        let mut sim = self.sim.lock().unwrap();
        if let Some(cursor) = sim.cursor.take() {
            sim.last_root = Some(cursor.root().to_path_buf());
            sim.last_seqno = cursor.seqno();
            tracing::info!("simulation replay disarmed");
        }
        drop(sim);
        self.simulation_status()
    }

    fn next_recorded_frame(&self) -> SequencerResult<(PathBuf, u32)> {
        let mut sim = self.sim.lock().unwrap();
        let Some(cursor) = sim.cursor.as_mut() else {
            return Err(SequencerError::InvalidRequest("not simulating".to_string()));
        };
        let seqno = cursor.seqno();
        match cursor.take_next() {
            Ok(path) => Ok((path, seqno)),
            Err(err) => {
                // Running off the end disarms replay; the next expose is real.
                if let Some(cursor) = sim.cursor.take() {
                    sim.last_root = Some(cursor.root().to_path_buf());
                    sim.last_seqno = cursor.seqno();
                }
                Err(err)
            }
        }
    }

    // =========================================================================
    // EXPOSURE
    // =========================================================================

    /// Run one exposure request end to end.
    pub async fn expose(
        &self,
        request: &ExposureRequest,
        sink: &dyn ProgressSink,
    ) -> SequencerResult<ExposureResult> {
        let _slot = self
            .slot
            .try_lock()
            .map_err(|_| CameraError::ExposureInProgress)?;

        if !request.itime.is_finite() || request.itime < 0.0 {
            return Err(CameraError::InvalidParameter(format!(
                "exposure time {} is not usable",
                request.itime
            ))
            .into());
        }
        if request.kind == ExposureKind::Bias && request.itime != 0.0 {
            return Err(CameraError::InvalidParameter(
                "bias frames integrate for zero seconds".to_string(),
            )
            .into());
        }

        if self.is_simulating() {
            return self.replay_one(request, sink).await;
        }

        let (dir, seqno, path) = self.resolve_path(request)?;
        let (dark_ref, flat_ref, flat_cartridge) =
            self.resolve_calibration(request, &dir, seqno, sink)?;

        let plan = CapturePlan {
            request,
            dir: &dir,
            seqno,
            path: &path,
            dark_ref: dark_ref.as_deref(),
            flat_ref: flat_ref.as_deref(),
            flat_cartridge,
        };

        let captures = self.capture_stack(request, sink).await?;
        match self.finish_exposure(&plan, captures) {
            Ok((class, stack, effective_itime)) => {
                sink.exposure_state(ExposureProgress::Done);
                Ok(ExposureResult {
                    path,
                    seqno,
                    kind: request.kind,
                    class,
                    itime: request.itime,
                    stack,
                    effective_itime,
                    dark_ref,
                    flat_ref,
                    flat_cartridge,
                    simulated: false,
                })
            }
            Err(err) => {
                // Capture errors already reported their own failed state;
                // this covers combine/write failures after the hardware part
                // succeeded.
                sink.exposure_state(ExposureProgress::Failed);
                Err(err)
            }
        }
    }

    /// Serve the next recorded frame instead of touching hardware.
    async fn replay_one(
        &self,
        request: &ExposureRequest,
        sink: &dyn ProgressSink,
    ) -> SequencerResult<ExposureResult> {
        if request.kind != ExposureKind::Object {
            return Err(SequencerError::InvalidRequest(format!(
                "{} exposures are not available while simulating",
                request.kind.as_str()
            )));
        }
        if request.filename.is_some() {
            tracing::warn!("explicit filename ignored while replaying recorded frames");
        }

        let (path, seqno) = self.next_recorded_frame()?;

        sink.exposure_state(ExposureProgress::Integrating {
            remaining_secs: request.itime,
            total_secs: request.itime,
        });
        tokio::time::sleep(Duration::from_secs_f64(request.itime)).await;
        sink.exposure_state(ExposureProgress::Done);

        tracing::info!(path = %path.display(), "re-served recorded frame");
        Ok(ExposureResult {
            path,
            seqno,
            kind: ExposureKind::Object,
            class: FrameClass::Object,
            itime: request.itime,
            stack: 1,
            effective_itime: request.itime,
            dark_ref: None,
            flat_ref: None,
            flat_cartridge: NO_CARTRIDGE,
            simulated: true,
        })
    }

    /// Output directory, sequence number, and file path for this request.
    fn resolve_path(&self, request: &ExposureRequest) -> SequencerResult<(PathBuf, u32, PathBuf)> {
        match &request.filename {
            Some(explicit) => {
                let (dir, path) = match explicit.parent().filter(|p| !p.as_os_str().is_empty()) {
                    Some(parent) => (parent.to_path_buf(), explicit.clone()),
                    None => {
                        let dir = ensure_night_dir(&self.data_root)?;
                        let path = dir.join(explicit);
                        (dir, path)
                    }
                };
                if !dir.is_dir() {
                    std::fs::create_dir_all(&dir)?;
                }
                // Sequence number from the name when it follows the frame
                // pattern, so calibration lookup still works.
                let seqno = match path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_frame_seqno)
                {
                    Some(seqno) => seqno,
                    None => next_seqno(&dir)?,
                };
                Ok((dir, seqno, path))
            }
            None => {
                let dir = ensure_night_dir(&self.data_root)?;
                let seqno = next_seqno(&dir)?;
                let path = frame_path(&dir, seqno);
                Ok((dir, seqno, path))
            }
        }
    }

    /// Apply the calibration policy. Only object frames need calibration on
    /// hand; refusal happens here, before any hardware call.
    fn resolve_calibration(
        &self,
        request: &ExposureRequest,
        dir: &Path,
        seqno: u32,
        sink: &dyn ProgressSink,
    ) -> SequencerResult<(Option<PathBuf>, Option<PathBuf>, i32)> {
        if request.kind != ExposureKind::Object {
            // Darks and flats are what calibration is made from.
            return Ok((None, None, request.cartridge.unwrap_or(NO_CARTRIDGE)));
        }

        let found = find_dark_and_flat(dir, seqno)?;

        let dark = match found.dark {
            Some(dark) => Some(dark),
            None if request.force_no_calibration => {
                let text = format!("no dark frame on hand in {}; exposing anyway", dir.display());
                tracing::warn!("{}", text);
                sink.warning(&text);
                None
            }
            None => return Err(SequencerError::CalibrationMissing { kind: "dark", seqno }),
        };

        let (flat, cartridge) = match found.flat {
            Some(flat) => (Some(flat), found.flat_cartridge),
            None if request.force_no_calibration => {
                let text = format!("no flat frame on hand in {}; exposing anyway", dir.display());
                tracing::warn!("{}", text);
                sink.warning(&text);
                (None, NO_CARTRIDGE)
            }
            None => return Err(SequencerError::CalibrationMissing { kind: "flat", seqno }),
        };

        Ok((dark, flat, cartridge))
    }

    /// Run the hardware captures, switching readout geometry for flats and
    /// restoring it afterwards, including on failure.
    async fn capture_stack(
        &self,
        request: &ExposureRequest,
        sink: &dyn ProgressSink,
    ) -> SequencerResult<Vec<RawExposure>> {
        let stack = request.stack.max(1);
        let previous = if request.kind == ExposureKind::Flat {
            Some(self.controller.current_format().await)
        } else {
            None
        };

        let outcome: SequencerResult<Vec<RawExposure>> = async {
            if previous.is_some() {
                self.controller
                    .set_format(ReadoutFormat::flat_field())
                    .await?;
            }
            let mut captures = Vec::with_capacity(stack as usize);
            for n in 1..=stack {
                if stack > 1 {
                    tracing::info!(frame = n, of = stack, "capturing stack frame");
                }
                let capture = self
                    .controller
                    .capture_one(request.itime, request.kind.opens_shutter(), sink)
                    .await?;
                captures.push(capture);
            }
            Ok(captures)
        }
        .await;

        if let Some(previous) = previous {
            if let Err(err) = self.controller.set_format(previous).await {
                tracing::warn!(error = %err, "could not restore readout format after flat");
            }
        }

        outcome
    }

    /// Combine, tag, and persist. The sidecar is written only after the
    /// FITS file itself, so a crash in between leaves no sidecar pointing
    /// at a missing frame.
    fn finish_exposure(
        &self,
        plan: &CapturePlan<'_>,
        captures: Vec<RawExposure>,
    ) -> SequencerResult<(FrameClass, u32, f64)> {
        let request = plan.request;
        let Some(first) = captures.first() else {
            return Err(SequencerError::InvalidRequest(
                "no frames captured".to_string(),
            ));
        };
        let class = first.class;
        let start = first.start;
        let ccd_temp = first.ccd_temp;
        let (bin_x, bin_y) = first.bin;
        let (origin_x, origin_y) = first.window_origin;
        let stack = captures.len() as u32;
        let effective_itime = request.itime * stack as f64;

        let frame = if stack > 1 {
            let frames: Vec<ImageFrame> = captures.into_iter().map(|c| c.frame).collect();
            median_combine(&frames)?
        } else {
            captures
                .into_iter()
                .next()
                .map(|c| c.frame)
                .ok_or_else(|| SequencerError::InvalidRequest("no frames captured".to_string()))?
        };

        let imagetyp = if request.kind == ExposureKind::Flat {
            "flat"
        } else {
            class.as_str()
        };

        let mut header = FitsHeader::new();
        header.set_string("IMAGETYP", imagetyp, None);
        header.set_float("EXPTIME", request.itime, None);
        if stack > 1 {
            header.set_int("EXPMULT", stack as i64, Some("number of stacked frames"));
            header.set_float("TOTEXPTM", effective_itime, Some("total integration, seconds"));
        }
        header.set_string("TIMESYS", "TAI", None);
        header.set_string("DATE-OBS", &format_start_time(start), Some("start of integration"));
        header.set_float("CCDTEMP", ccd_temp, Some("degrees C"));
        header.set_string("FILENAME", &plan.path.to_string_lossy(), None);
        if let Some(dark) = plan.dark_ref {
            header.set_string("DARKFILE", &dark.to_string_lossy(), None);
        }
        if let Some(flat) = plan.flat_ref {
            header.set_string("FLATFILE", &flat.to_string_lossy(), None);
        }
        if plan.flat_ref.is_some() || request.kind == ExposureKind::Flat {
            header.set_int("FLATCART", plan.flat_cartridge as i64, None);
        }
        header.set_int("BEGX", origin_x as i64, None);
        header.set_int("BEGY", origin_y as i64, None);
        header.set_int("BINX", bin_x as i64, None);
        header.set_int("BINY", bin_y as i64, None);

        write_u16_fits(plan.path, frame.width, frame.height, &frame.pixels, &header)?;
        tracing::info!(
            path = %plan.path.display(),
            kind = request.kind.as_str(),
            itime = request.itime,
            "wrote exposure"
        );

        match request.kind {
            ExposureKind::Dark => {
                write_dark_sidecar(plan.dir, plan.seqno, plan.path, ccd_temp)?;
                let mut cache = self.calibration.write().unwrap();
                cache.dark = Some(plan.path.to_path_buf());
            }
            ExposureKind::Flat => {
                let cartridge = request.cartridge.unwrap_or(NO_CARTRIDGE);
                write_flat_sidecar(plan.dir, plan.seqno, cartridge, plan.path)?;
                let mut cache = self.calibration.write().unwrap();
                cache.flat = Some(plan.path.to_path_buf());
                cache.cartridge = cartridge;
            }
            ExposureKind::Object | ExposureKind::Bias => {}
        }

        Ok((class, stack, effective_itime))
    }
}

/// DATE-OBS value: UTC wall clock to a tenth of a second, `Z`-suffixed.
fn format_start_time(start: SystemTime) -> String {
    let datetime: DateTime<Utc> = start.into();
    let tenths = datetime.timestamp_subsec_millis() / 100;
    format!("{}.{}Z", datetime.format("%Y-%m-%d %H:%M:%S"), tenths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use gcam_camera::vendor::sim::{SimCamera, SimShared};
    use gcam_camera::TimeoutConfig;
    use gcam_imaging::read_u16_fits;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSink {
        states: StdMutex<Vec<ExposureProgress>>,
        warnings: StdMutex<Vec<String>>,
    }

    impl ProgressSink for RecordingSink {
        fn exposure_state(&self, progress: ExposureProgress) {
            self.states.lock().unwrap().push(progress);
        }

        fn warning(&self, text: &str) {
            self.warnings.lock().unwrap().push(text.to_string());
        }
    }

    fn fast_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            exposure_poll_timeout: Duration::from_millis(500),
            fetch_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            warmup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            warmup_poll_interval: Duration::from_millis(5),
        }
    }

    async fn connected_sequencer(root: &Path) -> (ExposureSequencer, Arc<StdMutex<SimShared>>) {
        let camera = SimCamera::new();
        let shared = camera.shared();
        let controller = Arc::new(CameraController::new(Box::new(camera), fast_timeouts()));
        let state = controller.connect().await;
        assert!(state.ok, "simulated connect must succeed: {:?}", state.last_error);
        (ExposureSequencer::new(controller, root), shared)
    }

    fn calls_named(shared: &Arc<StdMutex<SimShared>>, name: &str) -> usize {
        shared
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == name)
            .count()
    }

    #[tokio::test]
    async fn test_object_resolves_calibration_and_writes_frame() {
        let root = tempdir().unwrap();
        let (sequencer, _shared) = connected_sequencer(root.path()).await;
        let night = ensure_night_dir(root.path()).unwrap();

        // Calibration taken earlier in the night.
        std::fs::write(night.join("gimg-0001.fits"), b"x").unwrap();
        write_dark_sidecar(&night, 1, &night.join("gimg-0001.fits"), -40.0).unwrap();
        std::fs::write(night.join("gimg-0002.fits"), b"x").unwrap();
        write_flat_sidecar(&night, 2, 5, &night.join("gimg-0002.fits")).unwrap();

        let sink = RecordingSink::default();
        let result = sequencer
            .expose(&ExposureRequest::object(0.05), &sink)
            .await
            .unwrap();

        assert_eq!(result.seqno, 3);
        assert_eq!(result.path, night.join("gimg-0003.fits"));
        assert_eq!(result.dark_ref, Some(night.join("gimg-0001.fits")));
        assert_eq!(result.flat_ref, Some(night.join("gimg-0002.fits")));
        assert_eq!(result.flat_cartridge, 5);
        assert!(!result.simulated);

        let image = read_u16_fits(&result.path).unwrap();
        assert_eq!(image.width, 524, "guide geometry: binned 1048 plus overscan");
        assert_eq!(image.header.get_str("IMAGETYP"), Some("object"));
        assert_eq!(image.header.get_float("EXPTIME"), Some(0.05));
        assert_eq!(image.header.get_str("TIMESYS"), Some("TAI"));
        assert_eq!(image.header.get_int("FLATCART"), Some(5));
        assert_eq!(image.header.get_int("BINX"), Some(2));
        assert_eq!(image.header.get_int("BEGX"), Some(1));
        let date_obs = image.header.get_str("DATE-OBS").unwrap();
        assert!(date_obs.ends_with('Z'), "DATE-OBS is UTC: {}", date_obs);

        let last = *sink.states.lock().unwrap().last().unwrap();
        assert_eq!(last, ExposureProgress::Done);
    }

    #[tokio::test]
    async fn test_object_without_calibration_refused_before_hardware() {
        let root = tempdir().unwrap();
        let (sequencer, shared) = connected_sequencer(root.path()).await;

        let sink = RecordingSink::default();
        let err = sequencer
            .expose(&ExposureRequest::object(0.05), &sink)
            .await
            .unwrap_err();

        assert!(
            matches!(err, SequencerError::CalibrationMissing { kind: "dark", .. }),
            "expected missing dark, got {:?}",
            err
        );
        assert_eq!(
            calls_named(&shared, "start_exposure"),
            0,
            "policy violations must not touch the hardware"
        );
    }

    #[tokio::test]
    async fn test_force_flag_exposes_without_calibration() {
        let root = tempdir().unwrap();
        let (sequencer, _shared) = connected_sequencer(root.path()).await;

        let mut request = ExposureRequest::object(0.05);
        request.force_no_calibration = true;

        let sink = RecordingSink::default();
        let result = sequencer.expose(&request, &sink).await.unwrap();

        assert!(result.path.is_file());
        assert_eq!(result.dark_ref, None);
        assert_eq!(result.flat_cartridge, NO_CARTRIDGE);
        assert_eq!(
            sink.warnings.lock().unwrap().len(),
            2,
            "one warning each for the missing dark and flat"
        );

        let image = read_u16_fits(&result.path).unwrap();
        assert_eq!(image.header.get_str("DARKFILE"), None);
        assert_eq!(image.header.get_str("FLATFILE"), None);
    }

    #[tokio::test]
    async fn test_dark_writes_sidecar_after_frame() {
        let root = tempdir().unwrap();
        let (sequencer, _shared) = connected_sequencer(root.path()).await;
        let night = ensure_night_dir(root.path()).unwrap();

        let sink = RecordingSink::default();
        let result = sequencer
            .expose(&ExposureRequest::dark(0.05), &sink)
            .await
            .unwrap();

        assert_eq!(result.class, FrameClass::Dark);
        let image = read_u16_fits(&result.path).unwrap();
        assert_eq!(image.header.get_str("IMAGETYP"), Some("dark"));

        let sidecar = night.join("dark-0001.dat");
        let body = std::fs::read_to_string(&sidecar).unwrap();
        assert!(
            body.starts_with("filename=gimg-0001.fits\n"),
            "sidecar body: {}",
            body
        );
        assert_eq!(
            sequencer.calibration_cache().dark,
            Some(result.path.clone())
        );
    }

    #[tokio::test]
    async fn test_zero_length_dark_is_a_zero_frame() {
        let root = tempdir().unwrap();
        let (sequencer, _shared) = connected_sequencer(root.path()).await;

        let sink = RecordingSink::default();
        let result = sequencer
            .expose(&ExposureRequest::dark(0.0), &sink)
            .await
            .unwrap();

        assert_eq!(result.class, FrameClass::Zero);
        let image = read_u16_fits(&result.path).unwrap();
        assert_eq!(image.header.get_str("IMAGETYP"), Some("zero"));
    }

    #[tokio::test]
    async fn test_bias_tags_zero_and_writes_no_sidecar() {
        let root = tempdir().unwrap();
        let (sequencer, _shared) = connected_sequencer(root.path()).await;
        let night = ensure_night_dir(root.path()).unwrap();

        let sink = RecordingSink::default();
        let result = sequencer
            .expose(&ExposureRequest::bias(), &sink)
            .await
            .unwrap();

        assert_eq!(result.kind, ExposureKind::Bias);
        assert_eq!(result.class, FrameClass::Zero);
        let image = read_u16_fits(&result.path).unwrap();
        assert_eq!(image.header.get_str("IMAGETYP"), Some("zero"));

        let sidecars: Vec<_> = std::fs::read_dir(&night)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "dat"))
            .collect();
        assert!(
            sidecars.is_empty(),
            "biases are not calibration records: {:?}",
            sidecars
        );

        let mut request = ExposureRequest::bias();
        request.itime = 1.0;
        let err = sequencer.expose(&request, &sink).await.unwrap_err();
        assert!(
            matches!(
                err,
                SequencerError::Camera(CameraError::InvalidParameter(_))
            ),
            "a timed bias makes no sense, got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_failed_capture_leaves_no_frame_or_sidecar() {
        let root = tempdir().unwrap();
        let (sequencer, shared) = connected_sequencer(root.path()).await;
        shared.lock().unwrap().behavior.fail_call = Some(("start_exposure".to_string(), 2));

        let sink = RecordingSink::default();
        let err = sequencer
            .expose(&ExposureRequest::dark(0.05), &sink)
            .await
            .unwrap_err();

        assert!(
            matches!(
                err,
                SequencerError::Camera(CameraError::HardwareCall { code: 2, .. })
            ),
            "expected the injected fault, got {:?}",
            err
        );

        let night = ensure_night_dir(root.path()).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(&night).unwrap().collect();
        assert!(
            leftovers.is_empty(),
            "failed capture must leave nothing behind: {:?}",
            leftovers
        );
        assert_eq!(sequencer.calibration_cache().dark, None);
    }

    #[tokio::test]
    async fn test_flat_switches_format_and_restores() {
        let root = tempdir().unwrap();
        let (sequencer, shared) = connected_sequencer(root.path()).await;
        let night = ensure_night_dir(root.path()).unwrap();

        let mut request = ExposureRequest::flat(0.05);
        request.cartridge = Some(11);

        let sink = RecordingSink::default();
        let result = sequencer.expose(&request, &sink).await.unwrap();

        assert_eq!(result.flat_cartridge, 11);
        let image = read_u16_fits(&result.path).unwrap();
        assert_eq!(image.width, 1048, "flats read out unbinned");
        assert_eq!(image.header.get_str("IMAGETYP"), Some("flat"));
        assert_eq!(image.header.get_int("FLATCART"), Some(11));

        assert_eq!(
            sequencer.controller().current_format().await,
            ReadoutFormat::guide(),
            "guide geometry must be restored after the flat"
        );
        assert_eq!(
            calls_named(&shared, "apply_format"),
            2,
            "one switch to flat geometry, one restore"
        );

        assert!(night.join("flat-0001-11.dat").is_file());
        let cache = sequencer.calibration_cache();
        assert_eq!(cache.flat, Some(result.path.clone()));
        assert_eq!(cache.cartridge, 11);
    }

    #[tokio::test]
    async fn test_stacked_dark_calls_hardware_per_frame_and_tags() {
        let root = tempdir().unwrap();
        let (sequencer, shared) = connected_sequencer(root.path()).await;
        shared.lock().unwrap().behavior.fill_value = Some(777);

        let mut request = ExposureRequest::dark(0.125);
        request.stack = 3;

        let sink = RecordingSink::default();
        let result = sequencer.expose(&request, &sink).await.unwrap();

        assert_eq!(result.stack, 3);
        assert_eq!(result.effective_itime, 0.375);
        assert_eq!(calls_named(&shared, "start_exposure"), 3);

        let image = read_u16_fits(&result.path).unwrap();
        assert_eq!(image.header.get_int("EXPMULT"), Some(3));
        assert_eq!(image.header.get_float("TOTEXPTM"), Some(0.375));
        assert_eq!(image.header.get_float("EXPTIME"), Some(0.125));
        assert!(
            image.pixels.iter().all(|&p| p == 777),
            "median of identical frames is the frame"
        );
    }

    #[tokio::test]
    async fn test_replay_serves_recorded_frames_then_exhausts() {
        let root = tempdir().unwrap();
        let night = root.path().join("55000");
        std::fs::create_dir(&night).unwrap();
        std::fs::write(night.join("gimg-0005.fits"), b"x").unwrap();

        // Replay must work without any hardware: never connect.
        let camera = SimCamera::new();
        let shared = camera.shared();
        let controller = Arc::new(CameraController::new(Box::new(camera), fast_timeouts()));
        let sequencer = ExposureSequencer::new(controller, root.path());

        let status = sequencer.simulate_from("55000", 5).unwrap();
        assert!(status.on);
        assert_eq!(status.seqno, 5);

        let sink = RecordingSink::default();
        let err = sequencer
            .expose(&ExposureRequest::dark(0.0), &sink)
            .await
            .unwrap_err();
        assert!(
            matches!(err, SequencerError::InvalidRequest(_)),
            "darks are refused while simulating, got {:?}",
            err
        );

        let result = sequencer
            .expose(&ExposureRequest::object(0.0), &sink)
            .await
            .unwrap();
        assert_eq!(result.path, night.join("gimg-0005.fits"));
        assert_eq!(result.seqno, 5);
        assert!(result.simulated);

        let err = sequencer
            .expose(&ExposureRequest::object(0.0), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::SimulationExhausted));
        assert!(
            !sequencer.simulation_status().on,
            "exhaustion disarms replay"
        );
        assert!(
            shared.lock().unwrap().calls.is_empty(),
            "replay must never touch the camera"
        );
    }

    #[tokio::test]
    async fn test_second_request_rejected_while_capturing() {
        let root = tempdir().unwrap();
        let (sequencer, _shared) = connected_sequencer(root.path()).await;
        let sequencer = Arc::new(sequencer);

        let first = {
            let sequencer = Arc::clone(&sequencer);
            tokio::spawn(async move {
                let sink = RecordingSink::default();
                sequencer.expose(&ExposureRequest::dark(0.3), &sink).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sink = RecordingSink::default();
        let err = sequencer
            .expose(&ExposureRequest::dark(0.0), &sink)
            .await
            .unwrap_err();
        assert!(
            matches!(err, SequencerError::Camera(CameraError::ExposureInProgress)),
            "expected busy rejection, got {:?}",
            err
        );

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resync_rebuilds_cache_from_disk() {
        let root = tempdir().unwrap();
        let (sequencer, _shared) = connected_sequencer(root.path()).await;
        let night = ensure_night_dir(root.path()).unwrap();

        std::fs::write(
            night.join("dark-0002.dat"),
            "filename=gimg-0002.fits\ntemp=-40.0\n",
        )
        .unwrap();
        std::fs::write(
            night.join("flat-0003-7.dat"),
            "filename=gimg-0003.fits\ncartridge=7\n",
        )
        .unwrap();
        // Frames through 0003 exist, so the next frame is 0004 and both
        // sidecars are strictly older than it.
        std::fs::write(night.join("gimg-0003.fits"), b"x").unwrap();

        let cache = sequencer.resync().unwrap();
        assert_eq!(cache.dark, Some(night.join("gimg-0002.fits")));
        assert_eq!(cache.flat, Some(night.join("gimg-0003.fits")));
        assert_eq!(cache.cartridge, 7);

        std::fs::remove_file(night.join("flat-0003-7.dat")).unwrap();
        let cache = sequencer.resync().unwrap();
        assert_eq!(cache.flat, None, "resync reflects what is on disk now");
        assert_eq!(cache.cartridge, NO_CARTRIDGE);
    }
}
