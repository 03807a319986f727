//! Observability infrastructure for the elastic node
//!
//! Provides:
//! - Prometheus metrics (tick latency, per-service allocation and latency,
//!   queue depth, infeasible estimates, sink errors)
//! - Structured logging of node lifecycle events with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, GaugeVec, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick latency (in seconds)
const TICK_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<NodeMetricsInner> = OnceLock::new();

struct NodeMetricsInner {
    tick_latency_seconds: Histogram,
    ticks: IntCounter,
    services: IntGauge,
    total_allocation: IntGauge,
    applied_allocation: IntGaugeVec,
    recommended_allocation: GaugeVec,
    response_time_ms: GaugeVec,
    completed_requests: IntCounterVec,
    pending_requests: IntGaugeVec,
    infeasible_estimates: IntCounterVec,
    sink_errors: IntCounter,
}

impl NodeMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "elastic_node_tick_latency_seconds",
                "Time spent in one control tick",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            ticks: register_int_counter!(
                "elastic_node_ticks_total",
                "Control ticks executed"
            )
            .expect("Failed to register ticks_total"),

            services: register_int_gauge!(
                "elastic_node_services",
                "Services currently hosted on the node"
            )
            .expect("Failed to register services"),

            total_allocation: register_int_gauge!(
                "elastic_node_total_allocation",
                "Sum of applied allocations after the last tick"
            )
            .expect("Failed to register total_allocation"),

            applied_allocation: register_int_gauge_vec!(
                "elastic_node_applied_allocation",
                "Workers applied to a service in the last tick",
                &["service"]
            )
            .expect("Failed to register applied_allocation"),

            recommended_allocation: register_gauge_vec!(
                "elastic_node_recommended_allocation",
                "Unclamped allocation recommended for a service in the last tick",
                &["service"]
            )
            .expect("Failed to register recommended_allocation"),

            response_time_ms: register_gauge_vec!(
                "elastic_node_response_time_ms",
                "Mean response time observed in the last control period",
                &["service"]
            )
            .expect("Failed to register response_time_ms"),

            completed_requests: register_int_counter_vec!(
                "elastic_node_completed_requests_total",
                "Requests completed per service",
                &["service"]
            )
            .expect("Failed to register completed_requests_total"),

            pending_requests: register_int_gauge_vec!(
                "elastic_node_pending_requests",
                "Requests queued but not started",
                &["service"]
            )
            .expect("Failed to register pending_requests"),

            infeasible_estimates: register_int_counter_vec!(
                "elastic_node_infeasible_estimates_total",
                "Ticks in which no allocation could meet the target response time",
                &["service"]
            )
            .expect("Failed to register infeasible_estimates_total"),

            sink_errors: register_int_counter!(
                "elastic_node_sink_errors_total",
                "Allocation records a sink failed to emit"
            )
            .expect("Failed to register sink_errors_total"),
        }
    }
}

/// Per-service values reported after a tick
#[derive(Debug, Clone, Copy)]
pub struct ServiceSample {
    pub applied: u32,
    pub recommended: f64,
    pub response_time_ms: f64,
    pub completed: u64,
    pub pending: usize,
    pub infeasible: bool,
}

/// Lightweight handle to the global node metrics; clones share them
#[derive(Clone)]
pub struct NodeMetrics {
    _private: (),
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(NodeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &NodeMetricsInner {
        GLOBAL_METRICS.get_or_init(NodeMetricsInner::new)
    }

    pub fn observe_tick(&self, duration_secs: f64, total_allocation: i64) {
        let inner = self.inner();
        inner.tick_latency_seconds.observe(duration_secs);
        inner.ticks.inc();
        inner.total_allocation.set(total_allocation);
    }

    pub fn record_service(&self, service: &str, sample: &ServiceSample) {
        let inner = self.inner();
        let labels = &[service];
        inner
            .applied_allocation
            .with_label_values(labels)
            .set(i64::from(sample.applied));
        inner
            .recommended_allocation
            .with_label_values(labels)
            .set(sample.recommended);
        inner
            .response_time_ms
            .with_label_values(labels)
            .set(sample.response_time_ms);
        inner
            .completed_requests
            .with_label_values(labels)
            .inc_by(sample.completed);
        inner
            .pending_requests
            .with_label_values(labels)
            .set(i64::try_from(sample.pending).unwrap_or(i64::MAX));
        if sample.infeasible {
            inner.infeasible_estimates.with_label_values(labels).inc();
        }
    }

    /// Drop the series of a removed service
    pub fn forget_service(&self, service: &str) {
        let inner = self.inner();
        let labels = &[service];
        let _ = inner.applied_allocation.remove_label_values(labels);
        let _ = inner.recommended_allocation.remove_label_values(labels);
        let _ = inner.response_time_ms.remove_label_values(labels);
        let _ = inner.pending_requests.remove_label_values(labels);
    }

    pub fn set_services(&self, count: usize) {
        self.inner()
            .services
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn inc_sink_errors(&self) {
        self.inner().sink_errors.inc();
    }
}

/// Structured logger for node lifecycle events
#[derive(Clone)]
pub struct NodeLogger {
    node_id: String,
}

impl NodeLogger {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn log_startup(&self, memory: u64, control_period_ms: u128, alpha: f64, control: bool) {
        info!(
            event = "node_started",
            node = %self.node_id,
            memory = memory,
            control_period_ms = control_period_ms as u64,
            alpha = alpha,
            control = control,
            "Elastic node control loop started"
        );
    }

    pub fn log_shutdown(&self, services: usize) {
        info!(
            event = "node_stopped",
            node = %self.node_id,
            services = services,
            "Elastic node stopped"
        );
    }

    pub fn log_service_added(&self, service: &str, memory: u64, target_rt_ms: f64, hint: f64) {
        info!(
            event = "service_added",
            node = %self.node_id,
            service = %service,
            memory = memory,
            target_rt_ms = target_rt_ms,
            target_allocation = hint,
            "Service registered"
        );
    }

    pub fn log_service_removed(&self, service: &str, abandoned: usize) {
        info!(
            event = "service_removed",
            node = %self.node_id,
            service = %service,
            abandoned_requests = abandoned,
            "Service removed"
        );
    }

    pub fn log_shortfall(&self, service: &str, observed_rt_ms: f64, target_rt_ms: f64) {
        warn!(
            event = "target_unreachable",
            node = %self.node_id,
            service = %service,
            observed_rt_ms = observed_rt_ms,
            target_rt_ms = target_rt_ms,
            "No allocation meets the target response time, applied the memory maximum"
        );
    }

    pub fn log_skipped_service(&self, epoch: u64, service: &str, reason: &str) {
        warn!(
            event = "service_skipped",
            node = %self.node_id,
            epoch = epoch,
            service = %service,
            reason = %reason,
            "Service skipped in control tick"
        );
    }

    pub fn log_observer_panic(&self, epoch: u64) {
        warn!(
            event = "observer_panicked",
            node = %self.node_id,
            epoch = epoch,
            "Tick observer panicked, continuing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_metrics_handles_share_registry() {
        let metrics = NodeMetrics::new();
        let other = metrics.clone();

        metrics.observe_tick(0.001, 4);
        other.record_service(
            "metrics-test",
            &ServiceSample {
                applied: 2,
                recommended: 1.7,
                response_time_ms: 90.0,
                completed: 12,
                pending: 3,
                infeasible: true,
            },
        );
        metrics.set_services(1);
        metrics.inc_sink_errors();
        metrics.forget_service("metrics-test");
        metrics.forget_service("never-seen");
    }

    #[test]
    fn test_node_logger_keeps_node_id() {
        let logger = NodeLogger::new("node-1");
        assert_eq!(logger.node_id(), "node-1");
    }
}
