//! Guide camera instrument control computer.
//!
//! Owns one guide camera, exposes a line-oriented TCP command interface,
//! and writes guider frames into nightly MJD directories. The configured
//! site picks the camera backend; everything else is common.

mod commands;
mod config;
mod server;
mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gcam_camera::{camera_for_site, CameraController, TimeoutConfig};
use gcam_sequencer::ExposureSequencer;

use crate::config::IccConfig;
use crate::server::{Icc, LogSink};

const LOG_FILE_PREFIX: &str = "gcamera.log";

// =============================================================================
// LOGGING
// =============================================================================

/// Route panics through the log before the process dies. The ICC runs
/// unattended; an unlogged panic at 3 am is invisible.
fn init_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {}: {}", location, panic_info);
        tracing::error!("PANIC at {}: {}", location, panic_info);
    }));
}

/// Console plus daily-rolling file logging. Returns the appender guard,
/// which must stay alive for the life of the process. Falls back to
/// console-only logging when the log directory cannot be created.
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    if let Some(log_dir) = log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!("Failed to create log directory: {}", e);
            return init_logging(None);
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let console_layer = fmt::layer().with_target(false).with_ansi(true);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        tracing::info!("Log directory: {}", log_dir.display());
        cleanup_old_logs(log_dir, 7);

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
        None
    }
}

/// Delete rolled log files older than `keep_days` days.
fn cleanup_old_logs(log_dir: &Path, keep_days: i64) {
    let cutoff = chrono::Local::now().date_naive() - chrono::Duration::days(keep_days);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log directory for cleanup: {}", e);
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        // Rolled files are named like "gcamera.log.2026-08-25".
        let Some(date_str) = name.strip_prefix(LOG_FILE_PREFIX).and_then(|s| s.strip_prefix('.'))
        else {
            continue;
        };

        let file_date = match chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => continue,
        };

        if file_date < cutoff {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to delete old log file {:?}: {}", path, e);
            } else {
                tracing::debug!("Deleted old log file {:?}", path);
            }
        }
    }
}

// =============================================================================
// STARTUP
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_panic_hook();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            IccConfig::load(&PathBuf::from(&path)).context("could not load configuration")?
        }
        None => IccConfig::default(),
    };

    let _log_guard = init_logging(config.log_dir.as_deref());

    tracing::info!(
        site = %config.site,
        data_root = %config.data_root.display(),
        "starting guide camera ICC v{}",
        env!("CARGO_PKG_VERSION")
    );

    let camera = camera_for_site(config.site, &config.camera_host, config.camera_port);
    let controller = Arc::new(
        CameraController::new(camera, TimeoutConfig::default())
            .with_safe_temp(config.safe_temp),
    );
    let sequencer = Arc::new(ExposureSequencer::new(
        controller.clone(),
        config.data_root.clone(),
    ));
    let icc = Arc::new(Icc::new(sequencer, config));

    // A camera that is off or unreachable is not fatal; the commander can
    // issue reconnect later.
    let state = icc.controller().connect().await;
    if state.ok {
        icc.condition_after_connect(&LogSink).await;
    } else {
        tracing::warn!(
            error = state.last_error.as_deref().unwrap_or("unknown error"),
            "camera not connected at startup, waiting for reconnect command"
        );
    }

    if let Err(err) = icc.sequencer().resync() {
        tracing::warn!(error = %err, "could not scan tonight's calibration sidecars");
    }

    server::serve(icc).await?;

    tracing::info!("guide camera ICC exiting");
    Ok(())
}
