//! Status keyword reporting.
//!
//! One place formats every status keyword so the `status` command, the
//! periodic status task, and individual command replies all say the same
//! thing in the same shape.

use gcam_sequencer::{CalibrationCache, SimulationStatus};

use crate::commands::{quote_text, CommandSink};
use crate::server::Icc;

/// `simulating=<On|Off>,<root>,<seqno>`. The root sticks around after
/// `simulate off` so the commander can see where the cursor stopped.
pub fn simulating_keyword(sim: &SimulationStatus) -> String {
    let state = if sim.on { "On" } else { "Off" };
    let root = match &sim.root {
        Some(root) => quote_text(&root.to_string_lossy()),
        None => "None".to_string(),
    };
    format!("simulating={},{},{}", state, root, sim.seqno)
}

/// `currentDark=...; currentFlat=...,<cartridge>` on one line.
pub fn calibration_keywords(cache: &CalibrationCache) -> String {
    let dark = match &cache.dark {
        Some(path) => quote_text(&path.to_string_lossy()),
        None => "none".to_string(),
    };
    let flat = match &cache.flat {
        Some(path) => quote_text(&path.to_string_lossy()),
        None => "none".to_string(),
    };
    format!(
        "currentDark={}; currentFlat={},{}",
        dark, flat, cache.cartridge
    )
}

/// Emit the full status keyword set through the sink.
pub async fn emit_status(icc: &Icc, sink: &dyn CommandSink) {
    let controller = icc.controller();

    let connection = controller.connection().await;
    sink.respond(&format!("cameraConnected={}", connection.ok));
    if let Some(detail) = connection.last_error.as_deref() {
        if !connection.ok {
            sink.warn(&format!("last camera error: {}", detail));
        }
    }

    let format = controller.current_format().await;
    sink.respond(&format!("binning={},{}", format.bin_x, format.bin_y));

    let cooler = match controller.read_cooler_status().await {
        Ok(state) => state,
        // Stale is better than nothing when the camera is away.
        Err(_) => controller.cooler_cache().await,
    };
    sink.respond(&format!("cooler={}", cooler.keyword_value()));

    match icc.sequencer().night_status() {
        Ok((dir, seqno)) => {
            sink.respond(&format!("nightDir={}", quote_text(&dir.to_string_lossy())));
            sink.respond(&format!("nextSeqno={}", seqno));
        }
        Err(err) => sink.warn(&format!("could not read night directory: {}", err)),
    }

    sink.respond(&calibration_keywords(&icc.sequencer().calibration_cache()));
    sink.respond(&simulating_keyword(&icc.sequencer().simulation_status()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcam_sequencer::NO_CARTRIDGE;
    use std::path::PathBuf;

    #[test]
    fn test_simulating_keyword_both_states() {
        let off = SimulationStatus {
            on: false,
            root: None,
            seqno: 1,
        };
        assert_eq!(simulating_keyword(&off), "simulating=Off,None,1");

        let on = SimulationStatus {
            on: true,
            root: Some(PathBuf::from("/data/gcam/55000")),
            seqno: 42,
        };
        assert_eq!(
            simulating_keyword(&on),
            "simulating=On,\"/data/gcam/55000\",42"
        );
    }

    #[test]
    fn test_calibration_keywords_empty_and_full() {
        assert_eq!(
            calibration_keywords(&CalibrationCache::default()),
            format!("currentDark=none; currentFlat=none,{}", NO_CARTRIDGE)
        );

        let cache = CalibrationCache {
            dark: Some(PathBuf::from("/d/gimg-0002.fits")),
            flat: Some(PathBuf::from("/d/gimg-0003.fits")),
            cartridge: 11,
        };
        assert_eq!(
            calibration_keywords(&cache),
            "currentDark=\"/d/gimg-0002.fits\"; currentFlat=\"/d/gimg-0003.fits\",11"
        );
    }
}
