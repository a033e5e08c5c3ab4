//! Background telemetry logger for serial-attached devices.
//!
//! A [`TelemetryLogger`] records every line a device prints on its serial
//! console into `<log folder>/<name>_serial_data.csv`, optionally prefixed with
//! a UTC timestamp, while the test flow keeps driving the bench.
//!
//! ```text
//! Idle --start()--> Capturing --stop()--> Idle
//! ```
//!
//! Each capture is one tokio task. `stop()` raises the cancellation signal and
//! waits for the task at most `stop_timeout`; the read timeout bounds how long
//! the task takes to notice.

use crate::capture::{run_capture, CaptureSettings, CaptureStatus, FileSink, DEFAULT_STOP_TIMEOUT};
use crate::error::{Fault, FaultKind, FaultOrigin, FaultResult};
use crate::interface::serial::{open_bounded, PortOpener, SerialConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, info_span, warn, Instrument, Span};

/// Result of [`TelemetryLogger::stop`].
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// The worker observed the stop request and closed the sink.
    Completed,
    /// The worker had already ended on an I/O fault.
    PortError(Fault),
    /// The worker did not finish within the stop timeout. It has been told to
    /// stop and is still owned by the logger until it drains.
    TimedOut,
    /// No capture was running.
    NotRunning,
}

struct Session {
    cancel: watch::Sender<bool>,
    worker: JoinHandle<CaptureStatus>,
}

/// Serial console recorder running on its own task.
pub struct TelemetryLogger {
    name: String,
    config: SerialConfig,
    opener: Arc<dyn PortOpener>,
    log_folder: PathBuf,
    timestamps: bool,
    auto_start: bool,
    attached: bool,
    stop_timeout: Duration,
    origin: FaultOrigin,
    session: Mutex<Option<Session>>,
    captured: Arc<AtomicU64>,
    span: Span,
}

impl TelemetryLogger {
    /// Create a logger for the device labelled `name`.
    ///
    /// The port is opened and closed once to check that it exists; failure is a
    /// Connection fault.
    pub async fn new(
        name: impl Into<String>,
        config: SerialConfig,
        opener: Arc<dyn PortOpener>,
        log_folder: impl Into<PathBuf>,
    ) -> FaultResult<Self> {
        let name = name.into();
        let origin = FaultOrigin::new(format!("{}Logger", name));
        let span = info_span!("logger", device = %name, port = %config.port);

        match open_bounded(opener.as_ref(), &config, &origin).await {
            Ok(mut port) => {
                if let Err(e) = port.shutdown().await {
                    warn!(parent: &span, error = %e, "error closing port after check");
                }
            }
            Err(fault) => {
                return Err(origin.could_not_connect(
                    format!("COM port '{}' not found. Check parameters", config.port),
                    &fault,
                ))
            }
        }

        Ok(Self {
            name,
            config,
            opener,
            log_folder: log_folder.into(),
            timestamps: true,
            auto_start: true,
            attached: false,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            origin,
            session: Mutex::new(None),
            captured: Arc::new(AtomicU64::new(0)),
            span,
        })
    }

    /// Prefix records with a UTC timestamp (default on).
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Start capturing on `attach` (default on).
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Bound on how long `stop` waits for the worker.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Replace the tracing span this logger logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Device label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port being recorded.
    pub fn port(&self) -> &str {
        &self.config.port
    }

    /// Folder the sink file is written to.
    pub fn log_folder(&self) -> &Path {
        &self.log_folder
    }

    /// Relocate the sink file; takes effect on the next `start`.
    pub fn set_log_folder(&mut self, log_folder: impl Into<PathBuf>) {
        self.log_folder = log_folder.into();
    }

    /// `<log folder>/<name>_serial_data.csv`
    pub fn data_path(&self) -> PathBuf {
        self.log_folder.join(format!("{}_serial_data.csv", self.name))
    }

    /// Records written by the current or most recent capture.
    pub fn lines_captured(&self) -> u64 {
        self.captured.load(Ordering::SeqCst)
    }

    /// True while a worker is running.
    pub async fn is_capturing(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.worker.is_finished())
    }

    /// Set the log folder and, with auto-start, begin capturing.
    pub async fn attach(&mut self, log_folder: impl Into<PathBuf>) -> FaultResult<()> {
        self.set_log_folder(log_folder);
        if self.auto_start {
            self.start().await?;
            self.attached = true;
        }
        Ok(())
    }

    /// Stop a capture begun by `attach`.
    pub async fn detach(&mut self) -> StopOutcome {
        if !self.attached {
            return StopOutcome::NotRunning;
        }
        self.attached = false;
        self.stop().await
    }

    /// Spawn the capture worker.
    ///
    /// Rejected with a Port fault while a worker is still running, including
    /// one that outlived a timed-out `stop`. A previous worker that already
    /// ended is replaced.
    pub async fn start(&self) -> FaultResult<()> {
        let mut session = self.session.lock().await;
        if let Some(running) = session.as_ref() {
            if !running.worker.is_finished() {
                return Err(self.origin.port("logging already running"));
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.captured.store(0, Ordering::SeqCst);

        let job = CaptureJob {
            config: self.config.clone(),
            opener: self.opener.clone(),
            path: self.data_path(),
            settings: CaptureSettings {
                timestamps: self.timestamps,
                read_timeout: self.config.read_timeout,
            },
            origin: self.origin.clone(),
            captured: self.captured.clone(),
        };
        let worker = tokio::spawn(job.run(cancel_rx).instrument(self.span.clone()));

        info!(parent: &self.span, path = %self.data_path().display(), "logging started");
        *session = Some(Session {
            cancel: cancel_tx,
            worker,
        });
        Ok(())
    }

    /// Signal the worker and wait for it, bounded by the stop timeout.
    ///
    /// On `TimedOut` the worker stays owned by the logger: `is_capturing`
    /// keeps reporting it and `start` is refused until it has drained. A later
    /// `stop` collects its final status.
    pub async fn stop(&self) -> StopOutcome {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return StopOutcome::NotRunning;
        };
        let _ = session.cancel.send(true);

        let joined = timeout(self.stop_timeout, &mut session.worker).await;
        let outcome = match joined {
            Ok(Ok(CaptureStatus::Completed)) => StopOutcome::Completed,
            Ok(Ok(CaptureStatus::PortError(fault))) => StopOutcome::PortError(fault),
            Ok(Err(e)) => StopOutcome::PortError(self.origin.wrap(FaultKind::Port, "logging task failed", e)),
            Err(_) => {
                warn!(parent: &self.span, timeout = ?self.stop_timeout, "logging task did not stop in time");
                return StopOutcome::TimedOut;
            }
        };
        *slot = None;
        info!(parent: &self.span, ?outcome, lines = self.lines_captured(), "logging stopped");
        outcome
    }
}

impl Drop for TelemetryLogger {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            let _ = session.cancel.send(true);
        }
    }
}

struct CaptureJob {
    config: SerialConfig,
    opener: Arc<dyn PortOpener>,
    path: PathBuf,
    settings: CaptureSettings,
    origin: FaultOrigin,
    captured: Arc<AtomicU64>,
}

impl CaptureJob {
    async fn run(self, cancel: watch::Receiver<bool>) -> CaptureStatus {
        let mut sink = match FileSink::create(&self.path).await {
            Ok(sink) => sink,
            Err(e) => {
                return CaptureStatus::PortError(self.origin.wrap(
                    FaultKind::Port,
                    format!("could not create {}", self.path.display()),
                    e,
                ))
            }
        };

        let port = match open_bounded(self.opener.as_ref(), &self.config, &self.origin).await {
            Ok(port) => port,
            Err(fault) => return CaptureStatus::PortError(fault),
        };
        let mut source = BufReader::new(port);

        let status = run_capture(&mut source, &mut sink, &self.settings, &cancel, &self.captured, &self.origin).await;

        if let Err(e) = source.get_mut().shutdown().await {
            warn!(error = %e, "error closing port");
        }
        info!(port = %self.config.port, ?status, "closing port");
        status
    }
}
