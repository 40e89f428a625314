//! Counter sink used by the consumer and the resize engine.
//!
//! Both sides only talk to [`MetricsSink`]; whether counters end up on a
//! Prometheus scrape endpoint or nowhere at all is decided once in `main`.

use async_trait::async_trait;
use metrics::{Label, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::MetricKindMask;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TelemetryConfig;

/// Errors raised while installing or stopping the metrics exporter
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),

    #[error("Telemetry shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Counters emitted by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    ThumbGenRequestReceived,
    ThumbDelRequestReceived,
    ThumbCreated,
}

impl Counter {
    pub fn name(&self) -> &'static str {
        match self {
            Counter::ThumbGenRequestReceived => "thumbnailer.thumb_gen_request.received",
            Counter::ThumbDelRequestReceived => "thumbnailer.thumb_del_request.received",
            Counter::ThumbCreated => "thumbnailer.thumbnail.created",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Counter::ThumbGenRequestReceived => "Number of received 'generate thumbnail' requests",
            Counter::ThumbDelRequestReceived => "Number of received 'delete thumbnail' requests",
            Counter::ThumbCreated => "Number of created thumbnails",
        }
    }

    const ALL: [Counter; 3] = [
        Counter::ThumbGenRequestReceived,
        Counter::ThumbDelRequestReceived,
        Counter::ThumbCreated,
    ];
}

/// Destination for counter increments
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Increment `counter` by one with the given attributes
    fn increment(&self, counter: Counter, attrs: &[(&'static str, String)]);

    /// Flush and stop the sink, giving up after `deadline`
    async fn shutdown(&self, deadline: Duration) -> Result<(), TelemetryError>;
}

/// Sink used when metrics export is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

#[async_trait]
impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: Counter, _attrs: &[(&'static str, String)]) {}

    async fn shutdown(&self, _deadline: Duration) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Sink backed by the global `metrics` recorder and a Prometheus scrape endpoint
pub struct PrometheusMetrics {
    exporter: Mutex<Option<JoinHandle<()>>>,
}

impl PrometheusMetrics {
    /// Install the Prometheus recorder and start serving the scrape endpoint.
    ///
    /// Counter series carry per-file attributes, so series idle for longer
    /// than `series_idle_timeout` are evicted.
    ///
    /// Must be called from within a Tokio runtime, at most once per process.
    pub fn install(
        port: u16,
        series_idle_timeout: Option<Duration>,
    ) -> Result<Self, TelemetryError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(addr)
            .idle_timeout(MetricKindMask::COUNTER, series_idle_timeout)
            .build()
            .map_err(|e| TelemetryError::Install(e.to_string()))?;

        metrics::set_global_recorder(recorder).map_err(|_| {
            TelemetryError::Install("a global metrics recorder is already installed".to_string())
        })?;

        for counter in Counter::ALL {
            metrics::describe_counter!(counter.name(), Unit::Count, counter.description());
        }

        let handle = tokio::spawn(async move {
            if let Err(e) = exporter.await {
                error!(error = ?e, "Prometheus exporter stopped");
            }
        });

        info!(
            port = port,
            series_idle_timeout = ?series_idle_timeout,
            "Prometheus metrics exporter started"
        );

        Ok(Self {
            exporter: Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl MetricsSink for PrometheusMetrics {
    fn increment(&self, counter: Counter, attrs: &[(&'static str, String)]) {
        debug!(metric = counter.name(), "Incrementing metric");
        let labels: Vec<Label> = attrs
            .iter()
            .map(|(key, value)| Label::new(*key, value.clone()))
            .collect();
        metrics::counter!(counter.name(), labels).increment(1);
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), TelemetryError> {
        let handle = match self.exporter.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(handle) = handle else {
            return Ok(());
        };

        handle.abort();
        match tokio::time::timeout(deadline, handle).await {
            Ok(_) => {
                debug!("Prometheus exporter stopped");
                Ok(())
            }
            Err(_) => {
                warn!(?deadline, "Prometheus exporter did not stop in time");
                Err(TelemetryError::ShutdownTimeout(deadline))
            }
        }
    }
}

/// Build the sink selected by configuration
pub fn init_metrics(config: &TelemetryConfig) -> Result<Arc<dyn MetricsSink>, TelemetryError> {
    if config.enabled {
        Ok(Arc::new(PrometheusMetrics::install(
            config.metrics_port,
            config.series_idle_timeout(),
        )?))
    } else {
        info!("Metrics export disabled, using no-op sink");
        Ok(Arc::new(NoopMetrics))
    }
}

/// In-memory sink for asserting on emitted counters in tests
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingMetrics {
    events: Mutex<Vec<(Counter, Vec<(&'static str, String)>)>>,
}

#[cfg(test)]
impl RecordingMetrics {
    pub(crate) fn events(&self) -> Vec<(Counter, Vec<(&'static str, String)>)> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, counter: Counter) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == counter)
            .count()
    }
}

#[cfg(test)]
#[async_trait]
impl MetricsSink for RecordingMetrics {
    fn increment(&self, counter: Counter, attrs: &[(&'static str, String)]) {
        self.events.lock().unwrap().push((counter, attrs.to_vec()));
    }

    async fn shutdown(&self, _deadline: Duration) -> Result<(), TelemetryError> {
        Ok(())
    }
}
