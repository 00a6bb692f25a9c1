use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

/// Full `EnvFilter` override, e.g. `drink_cam_core::session=trace,webrtc_ice=debug`.
pub const FILTER_ENV: &str = "DRINK_CAM_LOG_FILTER";
/// Lets webrtc and websocket internals log at the selected verbosity.
pub const TRACE_DEPS_ENV: &str = "DRINK_CAM_TRACE_DEPS";

const OWN_CRATES: &[&str] = &["drink_cam", "drink_cam_core", "signal_relay"];
const NOISY_CRATES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "tokio_tungstenite",
    "tungstenite",
    "hyper",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Verbosity> for LevelFilter {
    fn from(verbosity: Verbosity) -> Self {
        match verbosity {
            Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warn => LevelFilter::WARN,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogSettings {
    pub verbosity: Verbosity,
    /// Append to this file instead of stderr.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid log filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },
    #[error("another global subscriber is already installed")]
    AlreadyInstalled,
}

// Dropping the guard flushes and stops the writer thread, so it lives for the process.
static FLUSH_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Calls after a successful one do nothing.
pub fn init(settings: &LogSettings) -> Result<(), LoggingError> {
    if FLUSH_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(FILTER_ENV) {
        Ok(custom) => EnvFilter::try_new(&custom).map_err(|err| LoggingError::Filter {
            directive: custom.clone(),
            reason: err.to_string(),
        })?,
        Err(_) => default_filter(settings.verbosity, super::env_flag(TRACE_DEPS_ENV))?,
    };
    let (writer, guard) = open_writer(settings.file.as_deref())?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(settings.file.is_none())
        .with_target(settings.verbosity >= Verbosity::Debug)
        .with_thread_names(settings.verbosity == Verbosity::Trace)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| LoggingError::AlreadyInstalled)?;

    let _ = FLUSH_GUARD.set(guard);
    Ok(())
}

fn open_writer(path: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let Some(path) = path else {
        return Ok(tracing_appender::non_blocking(io::stderr()));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::OpenFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(tracing_appender::non_blocking(file))
}

/// Up to info everything shares one level. Debug and trace only raise our own crates;
/// the transport crates stay at warn unless `keep_deps` is set.
fn default_filter(verbosity: Verbosity, keep_deps: bool) -> Result<EnvFilter, LoggingError> {
    let level = LevelFilter::from(verbosity);
    if verbosity < Verbosity::Debug {
        return Ok(EnvFilter::builder()
            .with_default_directive(level.into())
            .parse_lossy(""));
    }

    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy("");
    for name in OWN_CRATES {
        filter = filter.add_directive(directive(name, level)?);
    }
    if !keep_deps {
        for name in NOISY_CRATES {
            filter = filter.add_directive(directive(name, LevelFilter::WARN)?);
        }
    }
    Ok(filter)
}

fn directive(target: &str, level: LevelFilter) -> Result<Directive, LoggingError> {
    let text = format!("{target}={level}");
    text.parse().map_err(|err: tracing_subscriber::filter::ParseError| LoggingError::Filter {
        directive: text.clone(),
        reason: err.to_string(),
    })
}

/// Offset, hex and printable columns, eight bytes per row.
pub fn hexdump(bytes: &[u8]) -> String {
    const ROW: usize = 8;
    let mut out = String::with_capacity(bytes.len() * 4 + 16);
    for (row, chunk) in bytes.chunks(ROW).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
        let text: String = chunk
            .iter()
            .map(|&byte| if byte.is_ascii_graphic() || byte == b' ' { byte as char } else { '.' })
            .collect();
        let _ = writeln!(
            out,
            "{:04x}: {:<width$} |{text}|",
            row * ROW,
            hex.join(" "),
            width = ROW * 3 - 1,
        );
    }
    out
}
