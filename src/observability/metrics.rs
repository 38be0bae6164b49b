//! Prometheus metrics.

use crate::config::MetricsSettings;
use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;

/// Installs the global Prometheus recorder.
///
/// With `expose`, an HTTP listener serves `/metrics` on `settings.port`.
/// Returns `None` when metrics are disabled.
pub fn install_prometheus(settings: &MetricsSettings, expose: bool) -> Result<Option<PrometheusHandle>> {
    if !settings.enabled {
        return Ok(None);
    }

    let builder = PrometheusBuilder::new();
    let handle = if expose {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.port);
        install_listener(builder.with_http_listener(addr))?
    } else {
        builder
            .install_recorder()
            .map_err(|e| Error::operation("metrics_recorder_install", e))?
    };
    tracing::debug!(expose, port = settings.port, "Installed Prometheus recorder");
    Ok(Some(handle))
}

/// Runs the exporter on a dedicated current-thread runtime, or on the
/// caller's runtime when there is one.
fn install_listener(builder: PrometheusBuilder) -> Result<PrometheusHandle> {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        return install_with_runtime(builder, &handle);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::operation("metrics_runtime_init", e))?;
    let handle = runtime.handle().clone();
    let prometheus = install_with_runtime(builder, &handle)?;
    thread::Builder::new()
        .name("tutorlog-metrics-http".to_string())
        .spawn(move || runtime.block_on(std::future::pending::<()>()))
        .map_err(|e| Error::operation("metrics_runtime_thread", e))?;
    Ok(prometheus)
}

fn install_with_runtime(
    builder: PrometheusBuilder,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<PrometheusHandle> {
    let (recorder, exporter) = {
        let _guard = runtime_handle.enter();
        builder
            .build()
            .map_err(|e| Error::operation("metrics_exporter_build", e))?
    };
    let handle = recorder.handle();
    set_global_recorder(recorder)?;
    runtime_handle.spawn(exporter);
    Ok(handle)
}

fn set_global_recorder(recorder: PrometheusRecorder) -> Result<()> {
    metrics::set_global_recorder(recorder).map_err(|e| Error::operation("metrics_recorder_install", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_installs_nothing() {
        let settings = MetricsSettings::default();
        assert!(install_prometheus(&settings, true).unwrap().is_none());
    }

    #[test]
    fn test_local_recorder_renders_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("ai_requests_total", "task" => "chat_reply", "status" => "success").increment(2);
        });
        let rendered = handle.render();
        assert!(rendered.contains("ai_requests_total"));
        assert!(rendered.contains("chat_reply"));
    }
}
