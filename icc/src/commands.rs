//! Command grammar and execution.
//!
//! Commands arrive as single lines of `verb key=value ... flag` words and
//! map one to one onto sequencer and controller operations. Replies go
//! through [`CommandSink`] so execution never knows about sockets; every
//! reply line carries a status prefix:
//!
//! - `i` informational keywords
//! - `w` warning
//! - `f` command failed
//! - `:` command done
//! - `d` diagnostic chatter

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use gcam_camera::{CoolerState, ExposureProgress, ProgressSink};
use gcam_sequencer::{ExposureRequest, SequencerError};

use crate::server::Icc;
use crate::status;

// =============================================================================
// SINK
// =============================================================================

/// Where reply lines go. The server backs this with a socket; tests with a
/// recording buffer.
pub trait CommandSink: Send + Sync {
    /// Keyword line.
    fn respond(&self, keywords: &str);
    /// Informational text.
    fn inform(&self, text: &str);
    fn warn(&self, text: &str);
    /// Terminal failure line.
    fn fail(&self, text: &str);
    /// Terminal success line, with optional trailing keywords.
    fn finish(&self, keywords: &str);
    fn diag(&self, text: &str);
}

/// Quote free text for a keyword value.
pub fn quote_text(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\\\""))
}

/// Adapts controller/sequencer progress callbacks onto reply keywords.
pub struct ProgressForwarder<'a> {
    pub sink: &'a dyn CommandSink,
}

impl ProgressSink for ProgressForwarder<'_> {
    fn exposure_state(&self, progress: ExposureProgress) {
        self.sink
            .respond(&format!("exposureState={}", progress.keyword_value()));
    }

    fn cooler_reading(&self, state: &CoolerState) {
        self.sink.respond(&format!("cooler={}", state.keyword_value()));
    }

    fn warning(&self, text: &str) {
        self.sink.warn(text);
    }
}

// =============================================================================
// GRAMMAR
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Expose {
        itime: f64,
        cartridge: Option<i32>,
        filename: Option<PathBuf>,
        stack: u32,
        force: bool,
    },
    Dark {
        itime: f64,
        filename: Option<PathBuf>,
        stack: u32,
    },
    Flat {
        itime: f64,
        cartridge: Option<i32>,
        filename: Option<PathBuf>,
        stack: u32,
    },
    SetTemp {
        setpoint: Option<f64>,
    },
    Status,
    Reconnect,
    Resync,
    Shutdown {
        force: bool,
    },
    SimulateOff,
    SimulateFrom {
        mjd: String,
        seqno: u32,
    },
    Ping,
}

/// Parsed `key=value` pairs and bare flag words from one command line.
struct Args {
    values: HashMap<String, String>,
    flags: Vec<String>,
}

impl Args {
    fn parse(words: &[&str]) -> Result<Self, String> {
        let mut values = HashMap::new();
        let mut flags = Vec::new();
        for word in words {
            match word.split_once('=') {
                Some((key, value)) => {
                    if values.insert(key.to_string(), value.to_string()).is_some() {
                        return Err(format!("duplicate keyword {}", key));
                    }
                }
                None => flags.push(word.to_string()),
            }
        }
        Ok(Self { values, flags })
    }

    fn take<T: FromStr>(&mut self, key: &str) -> Result<Option<T>, String> {
        match self.values.remove(key) {
            Some(raw) => raw
                .trim_matches('"')
                .parse()
                .map(Some)
                .map_err(|_| format!("bad value for {}: {}", key, raw)),
            None => Ok(None),
        }
    }

    fn require<T: FromStr>(&mut self, key: &str) -> Result<T, String> {
        self.take(key)?.ok_or_else(|| format!("missing keyword {}", key))
    }

    fn flag(&mut self, name: &str) -> bool {
        match self.flags.iter().position(|f| f == name) {
            Some(index) => {
                self.flags.remove(index);
                true
            }
            None => false,
        }
    }

    /// Anything left over is a typo worth rejecting loudly.
    fn finish(self, verb: &str) -> Result<(), String> {
        if let Some(key) = self.values.keys().next() {
            return Err(format!("unknown keyword for {}: {}", verb, key));
        }
        if let Some(flag) = self.flags.first() {
            return Err(format!("unknown flag for {}: {}", verb, flag));
        }
        Ok(())
    }
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, rest)) = words.split_first() else {
        return Err("empty command".to_string());
    };
    let mut args = Args::parse(rest)?;

    let command = match verb {
        "expose" => Command::Expose {
            itime: args.require("time")?,
            cartridge: args.take("cartridge")?,
            filename: args.take::<PathBuf>("filename")?,
            stack: args.take("stack")?.unwrap_or(1),
            force: args.flag("force"),
        },
        "dark" => Command::Dark {
            itime: args.require("time")?,
            filename: args.take::<PathBuf>("filename")?,
            stack: args.take("stack")?.unwrap_or(1),
        },
        "flat" => Command::Flat {
            itime: args.require("time")?,
            cartridge: args.take("cartridge")?,
            filename: args.take::<PathBuf>("filename")?,
            stack: args.take("stack")?.unwrap_or(1),
        },
        "setTemp" => Command::SetTemp {
            setpoint: args.take("temp")?,
        },
        "status" => Command::Status,
        "reconnect" => Command::Reconnect,
        "resync" => Command::Resync,
        "shutdown" => Command::Shutdown {
            force: args.flag("force"),
        },
        "simulate" => {
            if args.flag("off") {
                Command::SimulateOff
            } else {
                Command::SimulateFrom {
                    mjd: args.require("mjd")?,
                    seqno: args.require("seqno")?,
                }
            }
        }
        "ping" => Command::Ping,
        other => return Err(format!("unknown command {}", other)),
    };

    args.finish(verb)?;
    Ok(command)
}

// =============================================================================
// EXECUTION
// =============================================================================

/// Whether the server should keep serving after this command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Exit,
}

/// Run one parsed command against the ICC, reporting through the sink.
pub async fn execute(icc: &Icc, command: Command, sink: &dyn CommandSink) -> Disposition {
    match command {
        Command::Ping => {
            sink.finish(&format!("text={}", quote_text("Pong.")));
        }

        Command::Status => {
            status::emit_status(icc, sink).await;
            sink.finish("");
        }

        Command::Expose {
            itime,
            cartridge,
            filename,
            stack,
            force,
        } => {
            let mut request = ExposureRequest::object(itime);
            request.cartridge = cartridge;
            request.filename = filename;
            request.stack = stack;
            request.force_no_calibration = force;
            run_exposure(icc, request, sink).await;
        }

        Command::Dark {
            itime,
            filename,
            stack,
        } => {
            let mut request = ExposureRequest::dark(itime);
            request.filename = filename;
            request.stack = stack;
            run_exposure(icc, request, sink).await;
        }

        Command::Flat {
            itime,
            cartridge,
            filename,
            stack,
        } => {
            let mut request = ExposureRequest::flat(itime);
            request.cartridge = cartridge;
            request.filename = filename;
            request.stack = stack;
            run_exposure(icc, request, sink).await;
        }

        Command::SetTemp { setpoint } => {
            match icc.controller().set_cooler_setpoint(setpoint).await {
                Ok(state) => {
                    sink.respond(&format!("cooler={}", state.keyword_value()));
                    sink.finish("");
                }
                Err(err) => sink.fail(&err.to_string()),
            }
        }

        Command::Reconnect => {
            let state = icc.controller().reconnect().await;
            sink.respond(&format!("cameraConnected={}", state.ok));
            if state.ok {
                icc.condition_after_connect(sink).await;
                status::emit_status(icc, sink).await;
                sink.finish("");
            } else {
                let detail = state.last_error.as_deref().unwrap_or("unknown error");
                sink.fail(&format!("could not connect to camera: {}", detail));
            }
        }

        Command::Resync => match icc.sequencer().resync() {
            Ok(cache) => {
                sink.respond(&status::calibration_keywords(&cache));
                sink.finish("");
            }
            Err(err) => sink.fail(&err.to_string()),
        },

        Command::SimulateOff => {
            let sim = icc.sequencer().simulate_off();
            sink.finish(&status::simulating_keyword(&sim));
        }

        Command::SimulateFrom { mjd, seqno } => {
            match icc.sequencer().simulate_from(&mjd, seqno) {
                Ok(sim) => sink.finish(&status::simulating_keyword(&sim)),
                Err(err) => sink.fail(&err.to_string()),
            }
        }

        Command::Shutdown { force } => {
            if !force {
                sink.warn("ignoring shutdown command without force");
                sink.fail("shutdown requires the force flag");
                return Disposition::Continue;
            }
            sink.inform("warming up and powering off the camera");
            let forwarder = ProgressForwarder { sink };
            // Power is cut even when the warm-up times out.
            match icc.controller().shutdown(Some(&forwarder)).await {
                Ok(()) => sink.inform("camera powered off"),
                Err(err) => sink.warn(&err.to_string()),
            }
            sink.finish(&format!("text={}", quote_text("exiting")));
            return Disposition::Exit;
        }
    }

    Disposition::Continue
}

async fn run_exposure(icc: &Icc, request: ExposureRequest, sink: &dyn CommandSink) {
    let forwarder = ProgressForwarder { sink };
    match icc.sequencer().expose(&request, &forwarder).await {
        Ok(result) => {
            sink.finish(&format!(
                "filename={}",
                quote_text(&result.path.to_string_lossy())
            ));
        }
        Err(err @ SequencerError::SimulationExhausted) => {
            // Exhaustion disarmed replay; tell the commander before failing.
            let sim = icc.sequencer().simulation_status();
            sink.respond(&status::simulating_keyword(&sim));
            sink.fail(&err.to_string());
        }
        Err(err) => sink.fail(&err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use gcam_camera::{camera_for_site, CameraController, Site, TimeoutConfig};
    use gcam_sequencer::ExposureSequencer;

    use crate::config::IccConfig;

    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                lines: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, prefix: &str, body: &str) {
            let line = format!("{} {}", prefix, body).trim_end().to_string();
            self.lines.lock().unwrap().push(line);
        }

        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    impl CommandSink for RecordingSink {
        fn respond(&self, keywords: &str) {
            self.push("i", keywords);
        }

        fn inform(&self, text: &str) {
            self.push("i", text);
        }

        fn warn(&self, text: &str) {
            self.push("w", text);
        }

        fn fail(&self, text: &str) {
            self.push("f", text);
        }

        fn finish(&self, keywords: &str) {
            self.push(":", keywords);
        }

        fn diag(&self, text: &str) {
            self.push("d", text);
        }
    }

    fn test_icc() -> (tempfile::TempDir, Arc<Icc>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IccConfig::default();
        config.site = Site::Sim;
        config.data_root = dir.path().to_path_buf();
        let camera = camera_for_site(Site::Sim, "", 0);
        let controller = Arc::new(CameraController::new(camera, TimeoutConfig::default()));
        let sequencer = Arc::new(ExposureSequencer::new(controller, config.data_root.clone()));
        (dir, Arc::new(Icc::new(sequencer, config)))
    }

    #[tokio::test]
    async fn test_ping_answers_pong() {
        let (_dir, icc) = test_icc();
        let sink = RecordingSink::new();
        let disposition = execute(&icc, Command::Ping, &sink).await;
        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(sink.lines(), vec![": text=\"Pong.\"".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_without_force_is_refused() {
        let (_dir, icc) = test_icc();
        let sink = RecordingSink::new();
        let disposition = execute(&icc, Command::Shutdown { force: false }, &sink).await;
        assert_eq!(
            disposition,
            Disposition::Continue,
            "a refused shutdown must not stop the server"
        );
        let lines = sink.lines();
        assert!(lines[0].starts_with("w "), "expected a warning first: {:?}", lines);
        assert!(lines[1].starts_with("f "), "refusal ends in failure: {:?}", lines);
    }

    #[tokio::test]
    async fn test_shutdown_force_exits_even_without_camera() {
        let (_dir, icc) = test_icc();
        let sink = RecordingSink::new();
        let disposition = execute(&icc, Command::Shutdown { force: true }, &sink).await;
        assert_eq!(disposition, Disposition::Exit);
        let lines = sink.lines();
        assert_eq!(lines.last().unwrap(), ": text=\"exiting\"");
    }

    #[tokio::test]
    async fn test_set_temp_reports_cooler_keyword() {
        let (_dir, icc) = test_icc();
        assert!(icc.controller().connect().await.ok);
        let sink = RecordingSink::new();
        execute(
            &icc,
            Command::SetTemp {
                setpoint: Some(-40.0),
            },
            &sink,
        )
        .await;
        let lines = sink.lines();
        assert!(
            lines[0].starts_with("i cooler=-40.0,"),
            "cooler keyword leads with the setpoint: {:?}",
            lines
        );
        assert_eq!(lines[1], ":");
    }

    #[tokio::test]
    async fn test_simulate_off_reports_cursor_state() {
        let (_dir, icc) = test_icc();
        let sink = RecordingSink::new();
        execute(&icc, Command::SimulateOff, &sink).await;
        assert_eq!(sink.lines(), vec![": simulating=Off,None,1".to_string()]);
    }

    #[tokio::test]
    async fn test_status_emits_the_keyword_set() {
        let (_dir, icc) = test_icc();
        assert!(icc.controller().connect().await.ok);
        let sink = RecordingSink::new();
        execute(&icc, Command::Status, &sink).await;
        let lines = sink.lines();
        for expected in ["i cameraConnected=true", "i binning=2,2", "i nextSeqno=1"] {
            assert!(
                lines.iter().any(|l| l == expected),
                "missing {:?} in {:?}",
                expected,
                lines
            );
        }
        assert!(
            lines.iter().any(|l| l.starts_with("i cooler=")),
            "missing cooler keyword: {:?}",
            lines
        );
        assert!(
            lines.iter().any(|l| l.starts_with("i nightDir=")),
            "missing nightDir keyword: {:?}",
            lines
        );
        assert!(
            lines
                .iter()
                .any(|l| l == "i currentDark=none; currentFlat=none,-1"),
            "missing calibration keywords: {:?}",
            lines
        );
        assert!(
            lines.iter().any(|l| l == "i simulating=Off,None,1"),
            "missing simulating keyword: {:?}",
            lines
        );
        assert_eq!(lines.last().unwrap(), ":");
    }

    #[tokio::test]
    async fn test_expose_command_reports_filename() {
        let (dir, icc) = test_icc();
        assert!(icc.controller().connect().await.ok);
        let sink = RecordingSink::new();
        let command = parse_command("expose time=0 force").unwrap();
        let disposition = execute(&icc, command, &sink).await;
        assert_eq!(disposition, Disposition::Continue);
        let lines = sink.lines();
        let last = lines.last().unwrap();
        assert!(
            last.starts_with(": filename=\""),
            "expected a filename reply: {:?}",
            lines
        );
        assert!(
            last.contains("gimg-0001.fits"),
            "first frame of the night: {:?}",
            lines
        );
        let night = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        assert!(
            night.path().join("gimg-0001.fits").is_file(),
            "frame written to disk"
        );
    }

    #[test]
    fn test_expose_parses_all_keywords() {
        let command = parse_command("expose time=5.5 cartridge=11 stack=3 force").unwrap();
        assert_eq!(
            command,
            Command::Expose {
                itime: 5.5,
                cartridge: Some(11),
                filename: None,
                stack: 3,
                force: true,
            }
        );
    }

    #[test]
    fn test_expose_requires_time() {
        let err = parse_command("expose").unwrap_err();
        assert!(err.contains("time"), "got: {}", err);
    }

    #[test]
    fn test_quoted_filename_is_unwrapped() {
        let command = parse_command("expose time=1 filename=\"/data/gcam/55000/gimg-0001.fits\"")
            .unwrap();
        match command {
            Command::Expose { filename, .. } => {
                assert_eq!(
                    filename,
                    Some(PathBuf::from("/data/gcam/55000/gimg-0001.fits"))
                );
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_keywords_are_rejected() {
        assert!(parse_command("expose time=1 exposure=2").is_err());
        assert!(parse_command("dark time=1 cartridge=3").is_err(), "darks take no cartridge");
        assert!(parse_command("ping loudly").is_err());
        assert!(parse_command("blorp").is_err());
    }

    #[test]
    fn test_set_temp_with_and_without_value() {
        assert_eq!(
            parse_command("setTemp temp=-40").unwrap(),
            Command::SetTemp { setpoint: Some(-40.0) }
        );
        assert_eq!(
            parse_command("setTemp").unwrap(),
            Command::SetTemp { setpoint: None },
            "bare setTemp turns the cooler off"
        );
    }

    #[test]
    fn test_simulate_variants() {
        assert_eq!(parse_command("simulate off").unwrap(), Command::SimulateOff);
        assert_eq!(
            parse_command("simulate mjd=55000 seqno=42").unwrap(),
            Command::SimulateFrom {
                mjd: "55000".to_string(),
                seqno: 42,
            }
        );
        assert!(parse_command("simulate").is_err());
    }

    #[test]
    fn test_shutdown_force_flag() {
        assert_eq!(
            parse_command("shutdown").unwrap(),
            Command::Shutdown { force: false }
        );
        assert_eq!(
            parse_command("shutdown force").unwrap(),
            Command::Shutdown { force: true }
        );
    }

    #[test]
    fn test_quote_text_escapes_quotes() {
        assert_eq!(quote_text("Pong."), "\"Pong.\"");
        assert_eq!(quote_text("say \"hi\""), "\"say \\\"hi\\\"\"");
    }
}
