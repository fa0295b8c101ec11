//! Line-oriented TCP command server.
//!
//! ## Features
//!
//! - One task per connection, with a dedicated writer task fed over a
//!   channel so replies never block command handling
//! - Periodic status broadcast to every connected commander
//! - A `shutdown force` command on any connection stops the whole server

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};

use gcam_camera::{CameraController, ReadoutFormat};
use gcam_sequencer::ExposureSequencer;

use crate::commands::{self, quote_text, CommandSink, Disposition};
use crate::config::IccConfig;
use crate::status;

// =============================================================================
// SHARED STATE
// =============================================================================

/// Everything command execution needs, shared across connections.
pub struct Icc {
    sequencer: Arc<ExposureSequencer>,
    config: IccConfig,
    shutdown: Notify,
}

impl Icc {
    pub fn new(sequencer: Arc<ExposureSequencer>, config: IccConfig) -> Self {
        Self {
            sequencer,
            config,
            shutdown: Notify::new(),
        }
    }

    pub fn controller(&self) -> &CameraController {
        self.sequencer.controller()
    }

    pub fn sequencer(&self) -> &ExposureSequencer {
        &self.sequencer
    }

    pub fn config(&self) -> &IccConfig {
        &self.config
    }

    /// Apply the guide readout format and the configured cooler setpoint.
    /// Runs after every successful connect, including reconnects.
    pub async fn condition_after_connect(&self, sink: &dyn CommandSink) {
        if let Err(err) = self.controller().set_format(ReadoutFormat::guide()).await {
            sink.warn(&format!("could not apply guide readout format: {}", err));
        }
        if let Some(setpoint) = self.config.set_temp {
            match self.controller().set_cooler_setpoint(Some(setpoint)).await {
                Ok(state) => sink.respond(&format!("cooler={}", state.keyword_value())),
                Err(err) => sink.warn(&format!("could not set cooler setpoint: {}", err)),
            }
        }
    }
}

// =============================================================================
// REPLY SINKS
// =============================================================================

/// Reply line framing: a one-character status prefix, a space, keywords.
/// `i` informational, `w` warning, `f` failed, `:` done, `d` diagnostic.
fn frame_line(prefix: char, body: &str) -> String {
    if body.is_empty() {
        prefix.to_string()
    } else {
        format!("{} {}", prefix, body)
    }
}

/// Sink for one connection; lines go to its writer task.
struct LineSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LineSink {
    fn send(&self, prefix: char, body: &str) {
        // A closed channel means the commander hung up; nothing to do.
        let _ = self.tx.send(frame_line(prefix, body));
    }
}

impl CommandSink for LineSink {
    fn respond(&self, keywords: &str) {
        self.send('i', keywords);
    }

    fn inform(&self, text: &str) {
        self.send('i', &format!("text={}", quote_text(text)));
    }

    fn warn(&self, text: &str) {
        self.send('w', &format!("text={}", quote_text(text)));
    }

    fn fail(&self, text: &str) {
        self.send('f', &format!("text={}", quote_text(text)));
    }

    fn finish(&self, keywords: &str) {
        self.send(':', keywords);
    }

    fn diag(&self, text: &str) {
        self.send('d', &format!("text={}", quote_text(text)));
    }
}

/// Sink for the periodic status task; lines fan out to every connection.
struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

impl BroadcastSink {
    fn send(&self, prefix: char, body: &str) {
        let _ = self.tx.send(frame_line(prefix, body));
    }
}

impl CommandSink for BroadcastSink {
    fn respond(&self, keywords: &str) {
        self.send('i', keywords);
    }

    fn inform(&self, text: &str) {
        self.send('i', &format!("text={}", quote_text(text)));
    }

    fn warn(&self, text: &str) {
        self.send('w', &format!("text={}", quote_text(text)));
    }

    fn fail(&self, text: &str) {
        self.send('f', &format!("text={}", quote_text(text)));
    }

    fn finish(&self, keywords: &str) {
        self.send(':', keywords);
    }

    fn diag(&self, text: &str) {
        self.send('d', &format!("text={}", quote_text(text)));
    }
}

/// Sink for work done outside any connection, such as startup conditioning.
pub struct LogSink;

impl CommandSink for LogSink {
    fn respond(&self, keywords: &str) {
        tracing::info!("{keywords}");
    }

    fn inform(&self, text: &str) {
        tracing::info!("{text}");
    }

    fn warn(&self, text: &str) {
        tracing::warn!("{text}");
    }

    fn fail(&self, text: &str) {
        tracing::error!("{text}");
    }

    fn finish(&self, keywords: &str) {
        if !keywords.is_empty() {
            tracing::info!("{keywords}");
        }
    }

    fn diag(&self, text: &str) {
        tracing::debug!("{text}");
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Listen and serve until a `shutdown force` command arrives.
pub async fn serve(icc: Arc<Icc>) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        icc.config().listen_host,
        icc.config().listen_port
    );
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not listen on {}", addr))?;
    tracing::info!(addr = %addr, "command server listening");
    serve_on(listener, icc).await
}

async fn serve_on(listener: TcpListener, icc: Arc<Icc>) -> anyhow::Result<()> {
    let (status_tx, _) = broadcast::channel::<String>(64);
    spawn_periodic_status(icc.clone(), status_tx.clone());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                tracing::info!(peer = %peer, "commander connected");
                let icc = icc.clone();
                let status_rx = status_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(icc, stream, status_rx).await {
                        tracing::debug!(peer = %peer, error = %err, "connection error");
                    }
                    tracing::info!(peer = %peer, "commander disconnected");
                });
            }
            _ = icc.shutdown.notified() => {
                tracing::info!("shutdown commanded, stopping command server");
                return Ok(());
            }
        }
    }
}

fn spawn_periodic_status(icc: Arc<Icc>, tx: broadcast::Sender<String>) {
    let period = Duration::from_secs(icc.config().status_period_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; clients just got a greeting.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.receiver_count() == 0 {
                continue;
            }
            let sink = BroadcastSink { tx: tx.clone() };
            status::emit_status(&icc, &sink).await;
        }
    });
}

async fn handle_connection(
    icc: Arc<Icc>,
    stream: TcpStream,
    mut status_rx: broadcast::Receiver<String>,
) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(writer_task(write_half, rx));

    // Forward broadcast status into this connection's writer.
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match status_rx.recv().await {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let sink = LineSink { tx };
    sink.respond(&format!(
        "version={}",
        quote_text(env!("CARGO_PKG_VERSION"))
    ));

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(command = %line, "received command");
        let command = match commands::parse_command(line) {
            Ok(command) => command,
            Err(err) => {
                sink.fail(&err);
                continue;
            }
        };
        if commands::execute(&icc, command, &sink).await == Disposition::Exit {
            // Let the writer drain the final ack before the listener stops.
            tokio::time::sleep(Duration::from_millis(100)).await;
            icc.shutdown.notify_one();
            break;
        }
    }
    Ok(())
}

/// Drains reply lines to the socket, one line per message.
async fn writer_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            tracing::debug!(error = %err, "reply write failed, closing writer");
            break;
        }
        if let Err(err) = writer.write_all(b"\n").await {
            tracing::debug!(error = %err, "reply write failed, closing writer");
            break;
        }
    }
}
