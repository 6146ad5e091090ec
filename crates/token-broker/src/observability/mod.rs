//! Logging, tracing and metrics setup

#[cfg(feature = "metrics")]
mod metrics;

#[cfg(feature = "telemetry")]
mod telemetry;

#[cfg(feature = "metrics")]
pub use metrics::{
    init_metrics, record_audit_dropped, record_bootstrap, record_cache_hit, record_cache_miss,
    record_connection_closed, record_connection_opened, record_handshake_failure,
    record_issuance, render_metrics,
};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::TelemetryConfig;
use crate::{Error, Result};

type BaseSubscriber = Layered<EnvFilter, Registry>;
pub(crate) type BoxedLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync>;

/// Initialize the observability stack: metrics recorder, log output and,
/// with the `telemetry` feature, OTLP span export.
///
/// `RUST_LOG` takes precedence over the configured log level.
pub fn init_observability(config: &TelemetryConfig) -> Result<()> {
    #[cfg(feature = "metrics")]
    {
        init_metrics()?;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    #[allow(unused_mut)]
    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(config)];

    #[cfg(feature = "telemetry")]
    if let Some(layer) = telemetry::otel_layer(config)? {
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))?;

    #[cfg(feature = "telemetry")]
    if let Some(endpoint) = config.otlp_endpoint.as_deref() {
        tracing::info!("OpenTelemetry initialized with endpoint: {endpoint}");
    }

    Ok(())
}

fn fmt_layer(config: &TelemetryConfig) -> BoxedLayer {
    if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    }
}

/// Shutdown observability stack
#[allow(clippy::missing_const_for_fn)]
pub fn shutdown_observability() {
    #[cfg(feature = "telemetry")]
    {
        telemetry::shutdown_telemetry();
    }
}
