//! Night directories, frame numbering, and the simulation replay cursor.
//!
//! Guider frames live under `<dataRoot>/<mjd>/gimg-NNNN.fits` where `<mjd>`
//! is the SDSS night number: the MJD shifted by +0.3 days so the directory
//! rolls over mid-morning local time (16:48 UT) instead of midnight UT, and
//! one observing night stays in one directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{SequencerError, SequencerResult};

pub const FRAME_PREFIX: &str = "gimg";

/// MJD of the unix epoch (1970-01-01).
const UNIX_EPOCH_MJD: f64 = 40587.0;

/// SDSS night rollover offset, in days.
const NIGHT_ROLLOVER_DAYS: f64 = 0.3;

/// The SDSS night number for a given instant.
pub fn night_mjd(now: DateTime<Utc>) -> u32 {
    let unix_days = now.timestamp() as f64 / 86400.0;
    (unix_days + UNIX_EPOCH_MJD + NIGHT_ROLLOVER_DAYS).floor() as u32
}

pub fn current_night_mjd() -> u32 {
    night_mjd(Utc::now())
}

pub fn frame_filename(seqno: u32) -> String {
    format!("{}-{:04}.fits", FRAME_PREFIX, seqno)
}

pub fn frame_path(dir: &Path, seqno: u32) -> PathBuf {
    dir.join(frame_filename(seqno))
}

/// Parse a sequence number out of a frame filename. Only exact matches of
/// the `gimg-NNNN.fits` pattern count; anything else in the directory is
/// not ours.
pub fn parse_frame_seqno(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("gimg-")?.strip_suffix(".fits")?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The night directory for right now, created if it does not exist yet.
pub fn ensure_night_dir(data_root: &Path) -> SequencerResult<PathBuf> {
    let dir = data_root.join(current_night_mjd().to_string());
    if !dir.is_dir() {
        tracing::info!(dir = %dir.display(), "creating night directory");
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Next free frame number in a night directory: one past the highest
/// existing frame, or 1 in a fresh directory.
pub fn next_seqno(dir: &Path) -> SequencerResult<u32> {
    let mut highest = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(seqno) = entry.file_name().to_str().and_then(parse_frame_seqno) {
            highest = highest.max(seqno);
        }
    }
    Ok(highest + 1)
}

// =============================================================================
// SIMULATION REPLAY
// =============================================================================

/// Replay cursor over a previously recorded night.
///
/// Armed with a starting frame that must already exist; each take advances
/// one frame. Running past the last recorded frame is an error the caller
/// uses to disarm replay.
#[derive(Debug, Clone)]
pub struct SimulationCursor {
    root: PathBuf,
    seqno: u32,
}

impl SimulationCursor {
    pub fn arm(data_root: &Path, night: &str, seqno: u32) -> SequencerResult<Self> {
        let root = data_root.join(night);
        if !root.is_dir() {
            return Err(SequencerError::InvalidRequest(format!(
                "{} is not an existing directory",
                root.display()
            )));
        }
        let first = frame_path(&root, seqno);
        if !first.is_file() {
            return Err(SequencerError::InvalidRequest(format!(
                "{} is not an existing file",
                first.display()
            )));
        }
        tracing::info!(root = %root.display(), seqno, "armed simulation replay");
        Ok(Self { root, seqno })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    /// Take the frame under the cursor and advance.
    pub fn take_next(&mut self) -> SequencerResult<PathBuf> {
        let path = frame_path(&self.root, self.seqno);
        self.seqno += 1;
        if path.is_file() {
            Ok(path)
        } else {
            Err(SequencerError::SimulationExhausted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_night_rolls_over_at_sdss_offset() {
        // 1970-01-01 00:00 UT is MJD 40587; the +0.3 shift keeps the night
        // number there until 16:48 UT.
        let midnight = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(night_mjd(midnight), 40587);

        let before_rollover = Utc.timestamp_opt(16 * 3600 + 47 * 60, 0).unwrap();
        assert_eq!(night_mjd(before_rollover), 40587);

        let after_rollover = Utc.timestamp_opt(16 * 3600 + 49 * 60, 0).unwrap();
        assert_eq!(night_mjd(after_rollover), 40588);
    }

    #[test]
    fn test_frame_names_parse_strictly() {
        assert_eq!(parse_frame_seqno("gimg-0042.fits"), Some(42));
        assert_eq!(parse_frame_seqno("gimg-0001.fits"), Some(1));
        assert_eq!(parse_frame_seqno("gimg-42.fits"), None, "must be 4 digits");
        assert_eq!(parse_frame_seqno("gimg-00042.fits"), None);
        assert_eq!(parse_frame_seqno("dark-0042.fits"), None);
        assert_eq!(parse_frame_seqno("gimg-0042.dat"), None);
    }

    #[test]
    fn test_next_seqno_skips_foreign_files() {
        let dir = tempdir().unwrap();
        assert_eq!(next_seqno(dir.path()).unwrap(), 1, "fresh night starts at 1");

        std::fs::write(dir.path().join("gimg-0003.fits"), b"x").unwrap();
        std::fs::write(dir.path().join("gimg-0007.fits"), b"x").unwrap();
        std::fs::write(dir.path().join("dark-0009.dat"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(next_seqno(dir.path()).unwrap(), 8);
    }

    #[test]
    fn test_cursor_requires_existing_directory_and_frame() {
        let root = tempdir().unwrap();
        assert!(SimulationCursor::arm(root.path(), "55000", 1).is_err());

        let night = root.path().join("55000");
        std::fs::create_dir(&night).unwrap();
        assert!(
            SimulationCursor::arm(root.path(), "55000", 1).is_err(),
            "directory alone is not enough, the starting frame must exist"
        );

        std::fs::write(night.join("gimg-0001.fits"), b"x").unwrap();
        let cursor = SimulationCursor::arm(root.path(), "55000", 1).unwrap();
        assert_eq!(cursor.seqno(), 1);
    }

    #[test]
    fn test_cursor_advances_then_exhausts() {
        let root = tempdir().unwrap();
        let night = root.path().join("55000");
        std::fs::create_dir(&night).unwrap();
        std::fs::write(night.join("gimg-0004.fits"), b"x").unwrap();
        std::fs::write(night.join("gimg-0005.fits"), b"x").unwrap();

        let mut cursor = SimulationCursor::arm(root.path(), "55000", 4).unwrap();
        assert_eq!(cursor.take_next().unwrap(), night.join("gimg-0004.fits"));
        assert_eq!(cursor.take_next().unwrap(), night.join("gimg-0005.fits"));
        let err = cursor.take_next().unwrap_err();
        assert!(
            matches!(err, SequencerError::SimulationExhausted),
            "expected exhaustion, got {:?}",
            err
        );
    }
}
