//! Logging and OpenTelemetry initialisation.
//!
//! The server writes every formatted record through one log-worker thread
//! (stderr, plus the log file when `logging.logToFile` is set), so services
//! on other threads never wait on file I/O.  Process workers log JSON lines
//! on stderr instead and the supervisor re-emits them.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL. When set the OTLP HTTP exporter is activated. |
//! | `RUST_LOG` | Log filter; wins over `logging.logLevel`. |
//! | `PILOT_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use pilot_services::settings::LoggingSettings;
use pilot_types::PilotError;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// ─────────────────────────────────────────────────────────────────────────────
// Levels
// ─────────────────────────────────────────────────────────────────────────────

/// Map a numeric `logLevel` (10 debug, 20 info, 30 warning, 40 error,
/// 50 critical) onto a tracing filter.
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0..=9 => LevelFilter::TRACE,
        10..=19 => LevelFilter::DEBUG,
        20..=29 => LevelFilter::INFO,
        30..=39 => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    }
}

fn env_filter(logging: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_filter(logging.log_level).to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Log worker
// ─────────────────────────────────────────────────────────────────────────────

enum LogMessage {
    Record(Vec<u8>),
    Stop,
}

/// [`MakeWriter`] handing each formatted record to the log worker.
#[derive(Clone)]
pub struct LogWorkerWriter {
    tx: Sender<LogMessage>,
}

/// One record being formatted.  Sent to the worker when dropped.
pub struct LogRecord {
    tx: Sender<LogMessage>,
    buf: Vec<u8>,
}

impl Write for LogRecord {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogRecord {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let _ = self.tx.send(LogMessage::Record(std::mem::take(&mut self.buf)));
        }
    }
}

impl<'a> MakeWriter<'a> for LogWorkerWriter {
    type Writer = LogRecord;

    fn make_writer(&'a self) -> Self::Writer {
        LogRecord {
            tx: self.tx.clone(),
            buf: Vec::with_capacity(256),
        }
    }
}

/// The dedicated thread that owns every log sink.
pub struct LogWorker {
    tx: Sender<LogMessage>,
    handle: Option<JoinHandle<()>>,
}

impl LogWorker {
    /// Start the worker.  `log_file`, when given, is opened for append with
    /// its parent directories created; failure to open it leaves stderr as
    /// the only sink.
    pub fn start(log_file: Option<&Path>) -> Result<Self, PilotError> {
        Self::start_with(Box::new(io::stderr()), log_file)
    }

    fn start_with(console: Box<dyn Write + Send>, log_file: Option<&Path>) -> Result<Self, PilotError> {
        let file = log_file.and_then(|path| match open_log_file(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("[pilot-drive] cannot open log file {}: {e}", path.display());
                None
            }
        });
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("log-worker".to_string())
            .spawn(move || drain(rx, console, file))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn writer(&self) -> LogWorkerWriter {
        LogWorkerWriter { tx: self.tx.clone() }
    }
}

impl Drop for LogWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(LogMessage::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn drain(rx: Receiver<LogMessage>, mut console: Box<dyn Write + Send>, mut file: Option<File>) {
    while let Ok(LogMessage::Record(record)) = rx.recv() {
        let _ = console.write_all(&record);
        if let Some(f) = file.as_mut()
            && f.write_all(&record).is_err()
        {
            eprintln!("[pilot-drive] log file write failed, file logging disabled");
            file = None;
        }
    }
    let _ = console.flush();
    if let Some(mut f) = file {
        let _ = f.flush();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps the log worker and the OTel provider alive.  Dropping it flushes
/// pending spans, then the remaining log records.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
    worker: Option<LogWorker>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[pilot-drive] OpenTelemetry provider shutdown error: {e}");
        }
        self.worker.take();
    }
}

/// Server logging: log worker, env filter from settings, optional OTLP.
pub fn init_server(logging: &LoggingSettings) -> Result<TelemetryGuard, PilotError> {
    let log_file = logging.log_to_file.then(|| logging.log_file());
    let worker = LogWorker::start(log_file.as_deref())?;
    let use_json = std::env::var("PILOT_LOG_FORMAT").as_deref() == Ok("json");
    let provider = build_provider("pilot-drive");
    install(env_filter(logging), provider.as_ref(), worker.writer(), use_json, !logging.log_to_file)?;
    Ok(TelemetryGuard {
        provider,
        worker: Some(worker),
    })
}

/// Worker-process logging: JSON records on stderr for the supervisor.
pub fn init_worker(logging: &LoggingSettings) -> Result<TelemetryGuard, PilotError> {
    install(env_filter(logging), None, io::stderr, true, false)?;
    Ok(TelemetryGuard {
        provider: None,
        worker: None,
    })
}

fn install<W>(
    filter: EnvFilter,
    provider: Option<&SdkTracerProvider>,
    writer: W,
    json: bool,
    ansi: bool,
) -> Result<(), PilotError>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let otel_layer = provider.map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("pilot-drive")));
    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(otel_layer)
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(otel_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init()
    };
    result.map_err(|e| PilotError::Config(format!("logging already initialised: {e}")))
}

/// Build an [`SdkTracerProvider`] when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[pilot-drive] OTLP exporter init failed: {e}"))
        .ok()?;
    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // The simple exporter needs no async runtime; logging starts before the
    // Tokio runtime exists.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
