//! Prometheus metrics for the broker.
//!
//! Broker counters live in `relay_bus::BrokerStats`; this module mirrors a
//! snapshot of them into gauges so the text exposition can be scraped.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use relay_bus::StatsSnapshot;

use crate::TelemetryError;

lazy_static! {
    /// Process-wide registry used by [`BrokerMetrics::register`].
    pub static ref REGISTRY: Registry = Registry::new();
}

/// One gauge per broker counter, plus the derived in-flight count.
#[derive(Clone)]
pub struct BrokerMetrics {
    registry: Registry,
    messages_enqueued: IntGauge,
    messages_dispatched: IntGauge,
    deliveries: IntGauge,
    messages_dropped: IntGauge,
    requests_started: IntGauge,
    requests_completed: IntGauge,
    requests_timed_out: IntGauge,
    request_conflicts: IntGauge,
    requests_cancelled: IntGauge,
    requests_in_flight: IntGauge,
    unsolicited_messages: IntGauge,
}

fn gauge(name: &str, help: &str) -> Result<IntGauge, TelemetryError> {
    IntGauge::with_opts(Opts::new(name, help))
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

impl BrokerMetrics {
    /// Register the gauges in the process-wide [`REGISTRY`].
    ///
    /// Only one broker per process can do this; a second call fails with
    /// [`TelemetryError::MetricsInit`].
    pub fn register() -> Result<Self, TelemetryError> {
        Self::with_registry(REGISTRY.clone())
    }

    /// Register the gauges in a caller-owned registry.
    pub fn with_registry(registry: Registry) -> Result<Self, TelemetryError> {
        let metrics = Self {
            messages_enqueued: gauge(
                "relay_bus_messages_enqueued",
                "Envelopes accepted onto the dispatch queue",
            )?,
            messages_dispatched: gauge(
                "relay_bus_messages_dispatched",
                "Envelopes routed by the dispatch loop",
            )?,
            deliveries: gauge("relay_bus_deliveries", "Individual member deliveries")?,
            messages_dropped: gauge(
                "relay_bus_messages_dropped",
                "Envelopes that reached no member",
            )?,
            requests_started: gauge("relay_bus_requests_started", "Requests registered")?,
            requests_completed: gauge(
                "relay_bus_requests_completed",
                "Requests completed by a terminal response",
            )?,
            requests_timed_out: gauge(
                "relay_bus_requests_timed_out",
                "Requests that reached their deadline",
            )?,
            request_conflicts: gauge(
                "relay_bus_request_conflicts",
                "Requests rejected because their key was in flight",
            )?,
            requests_cancelled: gauge(
                "relay_bus_requests_cancelled",
                "Requests failed by member close",
            )?,
            requests_in_flight: gauge(
                "relay_bus_requests_in_flight",
                "Requests awaiting a terminal response",
            )?,
            unsolicited_messages: gauge(
                "relay_bus_unsolicited_messages",
                "Inbound messages handed to member handlers",
            )?,
            registry,
        };

        for metric in metrics.gauges() {
            metrics
                .registry
                .register(Box::new(metric.clone()))
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        }

        Ok(metrics)
    }

    fn gauges(&self) -> [&IntGauge; 11] {
        [
            &self.messages_enqueued,
            &self.messages_dispatched,
            &self.deliveries,
            &self.messages_dropped,
            &self.requests_started,
            &self.requests_completed,
            &self.requests_timed_out,
            &self.request_conflicts,
            &self.requests_cancelled,
            &self.requests_in_flight,
            &self.unsolicited_messages,
        ]
    }

    /// Copy a stats snapshot into the gauges.
    pub fn observe(&self, snapshot: &StatsSnapshot) {
        let set = |gauge: &IntGauge, value: u64| {
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
        };

        set(&self.messages_enqueued, snapshot.messages_enqueued);
        set(&self.messages_dispatched, snapshot.messages_dispatched);
        set(&self.deliveries, snapshot.deliveries);
        set(&self.messages_dropped, snapshot.messages_dropped);
        set(&self.requests_started, snapshot.requests_started);
        set(&self.requests_completed, snapshot.requests_completed);
        set(&self.requests_timed_out, snapshot.requests_timed_out);
        set(&self.request_conflicts, snapshot.request_conflicts);
        set(&self.requests_cancelled, snapshot.requests_cancelled);
        set(&self.requests_in_flight, snapshot.requests_in_flight());
        set(&self.unsolicited_messages, snapshot.unsolicited_messages);
    }

    /// The registry these gauges live in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode the registry as Prometheus text format.
    pub fn encode(&self) -> Result<String, TelemetryError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
    }
}
