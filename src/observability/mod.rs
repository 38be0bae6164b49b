//! Observability: log subscriber and metrics recorder setup.
//!
//! Library code only emits through the `tracing` and `metrics` facades; the
//! binary calls [`init`] once at startup.

mod logging;
mod metrics;

pub use logging::{LOG_FILE_ENV, LOG_FILTER_ENV, LOG_FORMAT_ENV, LogFormat, LoggingConfig};
pub use metrics::install_prometheus;

use crate::config::MetricsSettings;
use crate::{Error, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static OBSERVABILITY_INIT: OnceLock<()> = OnceLock::new();

/// Keeps the installed metrics recorder reachable.
#[derive(Debug, Default)]
pub struct ObservabilityHandle {
    metrics: Option<PrometheusHandle>,
}

impl ObservabilityHandle {
    /// Renders current metrics in Prometheus text format, if installed.
    #[must_use]
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

/// Installs the global subscriber and, when enabled, the metrics recorder.
///
/// # Errors
///
/// Returns an error when called twice, when the log file cannot be opened,
/// or when a global subscriber or recorder is already set.
pub fn init(
    logging: &LoggingConfig,
    metrics: &MetricsSettings,
    expose_metrics: bool,
) -> Result<ObservabilityHandle> {
    if OBSERVABILITY_INIT.get().is_some() {
        return Err(Error::operation(
            "observability_init",
            "observability already initialized",
        ));
    }

    let filter = EnvFilter::try_new(&logging.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match (&logging.file, logging.format) {
        (Some(path), LogFormat::Json) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(open_log_file(path)?)
                    .with_current_span(true)
                    .with_thread_names(true),
            )
            .try_init(),
        (Some(path), LogFormat::Pretty) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(open_log_file(path)?)
                    .with_ansi(false)
                    .with_thread_names(true),
            )
            .try_init(),
        (None, LogFormat::Json) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_thread_names(true),
            )
            .try_init(),
        (None, LogFormat::Pretty) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_thread_names(true),
            )
            .try_init(),
    };
    installed.map_err(|e| Error::operation("observability_init", e))?;

    let handle = ObservabilityHandle {
        metrics: install_prometheus(metrics, expose_metrics)?,
    };

    OBSERVABILITY_INIT
        .set(())
        .map_err(|()| Error::operation("observability_init", "failed to mark observability initialized"))?;
    Ok(handle)
}

/// Shared append-mode writer for the fmt layer.
#[derive(Clone)]
struct LogFileWriter {
    file: Arc<Mutex<File>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn open_log_file(path: &Path) -> Result<LogFileWriter> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::operation("create_log_dir", e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::operation("open_log_file", format!("{}: {e}", path.display())))?;
    Ok(LogFileWriter {
        file: Arc::new(Mutex::new(file)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_file_created_with_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("tutorlog.log");
        let mut writer = open_log_file(&path).unwrap();
        writer.write_all(b"line\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
    }

    #[test]
    fn test_handle_without_metrics_renders_nothing() {
        assert!(ObservabilityHandle::default().render_metrics().is_none());
    }
}
