//! Observability infrastructure for the CNI daemon
//!
//! Provides:
//! - Prometheus counters for every CNI request outcome and reaped port
//! - A gauge tracking the number of ports attached to this host
//! - Structured JSON lifecycle events with tracing

use crate::models::Command;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use std::sync::OnceLock;
use tracing::info;

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MetricsInner> = OnceLock::new();

struct MetricsInner {
    request_count: IntCounter,
    request_invalid_count: IntCounter,
    add_success_count: IntCounter,
    add_failure_count: IntCounter,
    del_success_count: IntCounter,
    del_failure_count: IntCounter,
    check_success_count: IntCounter,
    check_failure_count: IntCounter,
    reaped_port_success_count: IntCounter,
    reaped_port_failure_count: IntCounter,
    port_total: IntGauge,
}

macro_rules! counter {
    ($name:literal, $help:literal) => {
        register_int_counter!($name, $help).expect(concat!("Failed to register ", $name))
    };
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            request_count: counter!("cni_request_count", "Total number of CNI requests received"),
            request_invalid_count: counter!(
                "cni_request_invalid_count",
                "Number of CNI requests rejected as malformed"
            ),
            add_success_count: counter!("cni_add_success_count", "Number of successful ADD commands"),
            add_failure_count: counter!("cni_add_failure_count", "Number of failed ADD commands"),
            del_success_count: counter!("cni_del_success_count", "Number of successful DEL commands"),
            del_failure_count: counter!("cni_del_failure_count", "Number of failed DEL commands"),
            check_success_count: counter!(
                "cni_check_success_count",
                "Number of successful CHECK commands"
            ),
            check_failure_count: counter!("cni_check_failure_count", "Number of failed CHECK commands"),
            reaped_port_success_count: counter!(
                "cni_reaped_port_success_count",
                "Number of orphaned ports deleted by the reaper"
            ),
            reaped_port_failure_count: counter!(
                "cni_reaped_port_failure_count",
                "Number of orphaned ports the reaper failed to delete"
            ),
            port_total: register_int_gauge!(
                "cni_port_total",
                "Number of CNI ports attached to this host's server"
            )
            .expect("Failed to register cni_port_total"),
        }
    }
}

/// Handle to the process-wide CNI metrics
///
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct Metrics {
    _private: (),
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_request(&self) {
        self.inner().request_count.inc();
    }

    pub fn inc_invalid_request(&self) {
        self.inner().request_invalid_count.inc();
    }

    /// Record the outcome of a handled command
    pub fn record_outcome(&self, command: Command, success: bool) {
        let inner = self.inner();
        let counter = match (command, success) {
            (Command::Add, true) => &inner.add_success_count,
            (Command::Add, false) => &inner.add_failure_count,
            (Command::Del, true) => &inner.del_success_count,
            (Command::Del, false) => &inner.del_failure_count,
            (Command::Check, true) => &inner.check_success_count,
            (Command::Check, false) => &inner.check_failure_count,
            (Command::Version, _) => return,
        };
        counter.inc();
    }

    pub fn inc_reaped(&self) {
        self.inner().reaped_port_success_count.inc();
    }

    pub fn inc_reap_failed(&self) {
        self.inner().reaped_port_failure_count.inc();
    }

    pub fn set_port_total(&self, count: i64) {
        self.inner().port_total.set(count);
    }

    pub fn request_count(&self) -> u64 {
        self.inner().request_count.get()
    }

    pub fn reaped_count(&self) -> u64 {
        self.inner().reaped_port_success_count.get()
    }
}

/// Structured logger for daemon lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, listen_addr: &str) {
        info!(
            event = "daemon_started",
            node = %self.node_name,
            daemon_version = %version,
            listen_addr = %listen_addr,
            "OpenStack CNI daemon started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            node = %self.node_name,
            reason = %reason,
            "OpenStack CNI daemon shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_counters() {
        let first = Metrics::new();
        let second = Metrics::new();

        let before = second.request_count();
        first.inc_request();
        assert!(second.request_count() > before);

        first.record_outcome(Command::Add, true);
        first.record_outcome(Command::Version, false);
        first.set_port_total(3);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}
