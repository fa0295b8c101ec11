//! Dark/flat calibration lookup via sidecar records.
//!
//! Every successful dark or flat capture leaves a small text sidecar next
//! to the image (`dark-NNNN.dat`, `flat-NNNN-C.dat` with cartridge C). The
//! sidecars are the durable calibration index: resolution re-scans them
//! from disk every time, so dark/flat linkage survives process restarts and
//! `resync` is nothing more than a fresh scan.

use std::path::{Path, PathBuf};

use crate::error::SequencerResult;
use crate::paths::frame_filename;

/// Cartridge sentinel used when no flat has been taken yet.
pub const NO_CARTRIDGE: i32 = -1;

/// What resolution found for one target sequence number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationMatch {
    pub dark: Option<PathBuf>,
    pub flat: Option<PathBuf>,
    pub flat_cartridge: i32,
}

pub fn dark_sidecar_name(seqno: u32) -> String {
    format!("dark-{:04}.dat", seqno)
}

pub fn flat_sidecar_name(seqno: u32, cartridge: i32) -> String {
    format!("flat-{:04}-{}.dat", seqno, cartridge)
}

/// Record a dark capture. Written only after its FITS file is on disk, so
/// a sidecar never points at a frame that does not exist.
pub fn write_dark_sidecar(
    dir: &Path,
    seqno: u32,
    image: &Path,
    ccd_temp: f64,
) -> SequencerResult<PathBuf> {
    let path = dir.join(dark_sidecar_name(seqno));
    let body = format!("filename={}\ntemp={:.1}\n", basename(image), ccd_temp);
    std::fs::write(&path, body)?;
    tracing::debug!(sidecar = %path.display(), "recorded dark");
    Ok(path)
}

/// Record a flat capture and its cartridge binding.
pub fn write_flat_sidecar(
    dir: &Path,
    seqno: u32,
    cartridge: i32,
    image: &Path,
) -> SequencerResult<PathBuf> {
    let path = dir.join(flat_sidecar_name(seqno, cartridge));
    let body = format!("filename={}\ncartridge={}\n", basename(image), cartridge);
    std::fs::write(&path, body)?;
    tracing::debug!(sidecar = %path.display(), cartridge, "recorded flat");
    Ok(path)
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// The record with the highest sequence number strictly below the target.
///
/// Strictly below: a calibration frame taken *as* frame N cannot calibrate
/// frame N itself.
pub fn find_most_recent<T: Clone>(records: &[(u32, T)], target_seqno: u32) -> Option<(u32, T)> {
    let mut sorted: Vec<&(u32, T)> = records.iter().collect();
    sorted.sort_by(|a, b| b.0.cmp(&a.0));
    sorted
        .into_iter()
        .find(|(seqno, _)| *seqno < target_seqno)
        .cloned()
}

/// Scan a night directory for the dark and flat that apply to `target_seqno`.
pub fn find_dark_and_flat(dir: &Path, target_seqno: u32) -> SequencerResult<CalibrationMatch> {
    let mut darks: Vec<(u32, PathBuf)> = Vec::new();
    let mut flats: Vec<(u32, (PathBuf, i32))> = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seqno) = parse_dark_name(name) {
            darks.push((seqno, entry.path()));
        } else if let Some((seqno, cartridge)) = parse_flat_name(name) {
            flats.push((seqno, (entry.path(), cartridge)));
        }
    }

    let mut found = CalibrationMatch {
        flat_cartridge: NO_CARTRIDGE,
        ..Default::default()
    };
    if let Some((seqno, sidecar)) = find_most_recent(&darks, target_seqno) {
        found.dark = Some(sidecar_image(dir, seqno, &sidecar));
    }
    if let Some((seqno, (sidecar, cartridge))) = find_most_recent(&flats, target_seqno) {
        found.flat = Some(sidecar_image(dir, seqno, &sidecar));
        found.flat_cartridge = cartridge;
    }
    Ok(found)
}

fn parse_dark_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("dark-")?.strip_suffix(".dat")?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `flat-NNNN-C.dat`; the cartridge lives in the filename so resolution
/// does not need to open the sidecar.
fn parse_flat_name(name: &str) -> Option<(u32, i32)> {
    let body = name.strip_prefix("flat-")?.strip_suffix(".dat")?;
    let (digits, cartridge) = body.split_once('-')?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, cartridge.parse().ok()?))
}

/// Image path a sidecar points at. A sidecar with a damaged body still
/// resolves, via the frame name its own sequence number implies.
fn sidecar_image(dir: &Path, seqno: u32, sidecar: &Path) -> PathBuf {
    match read_sidecar_field(sidecar, "filename") {
        Some(name) => dir.join(name),
        None => {
            tracing::warn!(
                sidecar = %sidecar.display(),
                "sidecar has no filename line, deriving from its sequence number"
            );
            dir.join(frame_filename(seqno))
        }
    }
}

fn read_sidecar_field(path: &Path, key: &str) -> Option<String> {
    let body = std::fs::read_to_string(path).ok()?;
    body.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?;
        let value = rest.strip_prefix('=')?;
        Some(value.trim().to_string())
    })
}
