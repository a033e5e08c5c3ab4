//! Line capture loop shared by the telemetry logger and serial stream mode.
//!
//! A capture run reads newline-delimited text from a [`LineSource`], optionally
//! prefixes each record with a UTC timestamp, and hands it to a [`LineSink`]. The
//! loop checks its cancellation signal at the top of every iteration and bounds
//! each read by the read timeout, so a stop request takes effect within one read
//! timeout. Partially received lines are kept across timeouts and only complete
//! lines reach the sink.

use crate::error::{Fault, FaultKind, FaultOrigin};
use crate::interface::serial::{DynSerial, SharedPort};
use async_trait::async_trait;
use chrono::Utc;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Default bound on how long a stop request waits for the capture worker.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// `strftime` pattern of the record prefix, e.g. `[2024-05-01 12:00:00.123456]`.
pub const TIMESTAMP_FORMAT: &str = "[%Y-%m-%d %H:%M:%S%.6f]";

/// How a capture run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureStatus {
    /// Stopped on request.
    Completed,
    /// A read or sink write failed; the loop ended without retrying.
    PortError(Fault),
}

/// Result of one bounded line read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// A full line (terminated by `\n`) is in the pending buffer.
    Line,
    /// The read timeout passed; pending bytes, if any, are kept.
    Idle,
    /// The peer closed the link.
    Closed,
}

/// Something that yields newline-terminated lines.
#[async_trait]
pub trait LineSource: Send {
    /// Read until `\n` into `pending`, giving up after `limit`.
    async fn read_line(&mut self, pending: &mut Vec<u8>, limit: Duration) -> io::Result<LineRead>;
}

async fn read_line_bounded<R>(reader: &mut R, pending: &mut Vec<u8>, limit: Duration) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin + Send,
{
    // read_until keeps already-consumed bytes in `pending` when the timeout fires
    match timeout(limit, reader.read_until(b'\n', pending)).await {
        Err(_) => Ok(LineRead::Idle),
        Ok(Ok(0)) => Ok(LineRead::Closed),
        Ok(Ok(_)) if pending.last() == Some(&b'\n') => Ok(LineRead::Line),
        Ok(Ok(_)) => Ok(LineRead::Closed),
        Ok(Err(e)) => Err(e),
    }
}

#[async_trait]
impl LineSource for BufReader<DynSerial> {
    async fn read_line(&mut self, pending: &mut Vec<u8>, limit: Duration) -> io::Result<LineRead> {
        read_line_bounded(self, pending, limit).await
    }
}

#[async_trait]
impl LineSource for SharedPort {
    async fn read_line(&mut self, pending: &mut Vec<u8>, limit: Duration) -> io::Result<LineRead> {
        // Lock per line so the owner can still write between records
        let mut guard = self.lock().await;
        read_line_bounded(&mut *guard, pending, limit).await
    }
}

/// Destination of captured records.
#[async_trait]
pub trait LineSink: Send {
    /// Append one record (without trailing newline).
    async fn record(&mut self, line: &str) -> io::Result<()>;

    /// Flush and close. Called once when the loop ends.
    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Newline-terminated text file, flushed after every record.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    /// Create (truncate) the sink file.
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

#[async_trait]
impl LineSink for FileSink {
    async fn record(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await
    }
}

/// In-memory record buffer used by serial stream mode.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Vec<String>,
}

impl MemorySink {
    /// Captured records in arrival order.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Records joined with `\n`.
    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}

#[async_trait]
impl LineSink for MemorySink {
    async fn record(&mut self, line: &str) -> io::Result<()> {
        self.lines.push(line.to_string());
        Ok(())
    }
}

/// Format a received line as a sink record.
pub fn format_record(line: &str, timestamps: bool) -> String {
    if timestamps {
        format!("{} {}", Utc::now().format(TIMESTAMP_FORMAT), line)
    } else {
        line.to_string()
    }
}

/// Parameters of one capture run.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Prefix each record with a UTC timestamp.
    pub timestamps: bool,
    /// Bound on each line read, and therefore on stop latency.
    pub read_timeout: Duration,
}

/// Run the capture loop until `cancel` turns true or a read fails.
///
/// Records are text: bytes are decoded lossily as UTF-8, trimmed, and blank
/// lines are skipped. Returns the completion status; the sink is always
/// finished, even after a port error.
pub async fn run_capture<L, S>(
    source: &mut L,
    sink: &mut S,
    settings: &CaptureSettings,
    cancel: &watch::Receiver<bool>,
    captured: &Arc<AtomicU64>,
    origin: &FaultOrigin,
) -> CaptureStatus
where
    L: LineSource + ?Sized,
    S: LineSink + ?Sized,
{
    let mut pending = Vec::with_capacity(256);
    let status = loop {
        if *cancel.borrow() {
            break CaptureStatus::Completed;
        }

        match source.read_line(&mut pending, settings.read_timeout).await {
            Ok(LineRead::Idle) => continue,
            Ok(LineRead::Line) => {
                let text = String::from_utf8_lossy(&pending).trim_end_matches(['\r', '\n']).to_string();
                pending.clear();
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                debug!(line = text, "captured");
                let record = format_record(text, settings.timestamps);
                if let Err(e) = sink.record(&record).await {
                    break CaptureStatus::PortError(origin.wrap(FaultKind::Port, "failed to write capture sink", e));
                }
                captured.fetch_add(1, Ordering::SeqCst);
            }
            Ok(LineRead::Closed) => {
                break CaptureStatus::PortError(origin.port("port closed during capture"));
            }
            Err(e) => {
                break CaptureStatus::PortError(origin.wrap(FaultKind::Port, "read failed during capture", e));
            }
        }
    };

    if let Err(e) = sink.finish().await {
        error!(error = %e, "failed to close capture sink");
    }

    match &status {
        CaptureStatus::Completed => info!(
            records = captured.load(Ordering::SeqCst),
            "capture complete"
        ),
        CaptureStatus::PortError(fault) => error!(%fault, "capture ended with port error"),
    }
    status
}
