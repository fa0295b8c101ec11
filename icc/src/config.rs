//! ICC configuration.
//!
//! Loaded from a TOML file whose keys match the keyword casing the rest of
//! the observatory uses (`dataRoot`, `statusPeriodSecs`, ...). Every field
//! has a default so a bare `site = "sim"` file is a working configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use gcam_camera::{Site, DEFAULT_SAFE_TEMP_DEGC};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IccConfig {
    /// Selects the camera backend: `apo` = Alta, `lco` = Andor, `sim`.
    pub site: Site,
    pub listen_host: String,
    pub listen_port: u16,
    /// Camera network address; only the Alta is reached over the network.
    pub camera_host: String,
    pub camera_port: u16,
    pub data_root: PathBuf,
    /// Cooler setpoint programmed after every successful connect.
    /// Absent disables the cooler instead.
    pub set_temp: Option<f64>,
    pub status_period_secs: u64,
    /// CCD must warm to this before shutdown powers the camera off.
    pub safe_temp: f64,
    /// Log file directory; console-only logging when absent.
    pub log_dir: Option<PathBuf>,
}

impl Default for IccConfig {
    fn default() -> Self {
        Self {
            site: Site::Sim,
            listen_host: "0.0.0.0".to_string(),
            listen_port: 9993,
            camera_host: "alta".to_string(),
            camera_port: 80,
            data_root: PathBuf::from("/data/gcam"),
            set_temp: Some(-40.0),
            status_period_secs: 300,
            safe_temp: DEFAULT_SAFE_TEMP_DEGC,
            log_dir: None,
        }
    }
}

impl IccConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: IccConfig =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}
