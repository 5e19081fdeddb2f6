//! # Delivery Metrics
//!
//! Engine components report through an injected [`MetricsSink`] rather than
//! reaching for the global recorder, so tests can assert on what was
//! reported and embedders can route metrics wherever they like.

use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::queue::QueueStats;

/// Final or intermediate result of processing one leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    Success,
    Retry,
    Discarded,
    Failure,
    RateLimited,
    /// Job acknowledged without sending (missing or settled delivery).
    Skipped,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::Retry => "retry",
            DeliveryOutcome::Discarded => "discarded",
            DeliveryOutcome::Failure => "failure",
            DeliveryOutcome::RateLimited => "rate_limited",
            DeliveryOutcome::Skipped => "skipped",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn queue_stats(&self, stats: &QueueStats);

    fn delivery_outcome(&self, outcome: DeliveryOutcome);

    /// Latency of one HTTP dispatch, labelled by status class (`2xx`,
    /// `5xx`, `error`).
    fn dispatch_latency(&self, elapsed: Duration, status_class: &'static str);

    fn queue_error(&self, operation: &'static str);

    fn jobs_promoted(&self, count: u64);

    fn leases_reclaimed(&self, count: u64);

    fn rate_limit_store_failure(&self, policy: &'static str);

    fn event_ingested(&self, outcome: &'static str, deliveries: usize);

    fn endpoint_deactivated(&self);
}

/// Forwards to the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn queue_stats(&self, stats: &QueueStats) {
        gauge!("courier_queue_scheduled").set(stats.scheduled as f64);
        gauge!("courier_queue_ready").set(stats.ready as f64);
        gauge!("courier_queue_pending").set(stats.pending as f64);
    }

    fn delivery_outcome(&self, outcome: DeliveryOutcome) {
        counter!("courier_delivery_outcomes_total", "outcome" => outcome.as_str()).increment(1);
    }

    fn dispatch_latency(&self, elapsed: Duration, status_class: &'static str) {
        histogram!("courier_dispatch_latency_ms", "status_class" => status_class)
            .record(elapsed.as_secs_f64() * 1_000.0);
    }

    fn queue_error(&self, operation: &'static str) {
        counter!("courier_queue_errors_total", "operation" => operation).increment(1);
    }

    fn jobs_promoted(&self, count: u64) {
        counter!("courier_queue_promoted_total").increment(count);
    }

    fn leases_reclaimed(&self, count: u64) {
        counter!("courier_queue_reclaimed_total").increment(count);
    }

    fn rate_limit_store_failure(&self, policy: &'static str) {
        counter!("courier_rate_limit_store_failures_total", "policy" => policy).increment(1);
    }

    fn event_ingested(&self, outcome: &'static str, deliveries: usize) {
        counter!("courier_events_ingested_total", "outcome" => outcome).increment(1);
        counter!("courier_deliveries_created_total").increment(deliveries as u64);
    }

    fn endpoint_deactivated(&self) {
        counter!("courier_endpoints_deactivated_total").increment(1);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn queue_stats(&self, _stats: &QueueStats) {}
    fn delivery_outcome(&self, _outcome: DeliveryOutcome) {}
    fn dispatch_latency(&self, _elapsed: Duration, _status_class: &'static str) {}
    fn queue_error(&self, _operation: &'static str) {}
    fn jobs_promoted(&self, _count: u64) {}
    fn leases_reclaimed(&self, _count: u64) {}
    fn rate_limit_store_failure(&self, _policy: &'static str) {}
    fn event_ingested(&self, _outcome: &'static str, _deliveries: usize) {}
    fn endpoint_deactivated(&self) {}
}

/// Records delivery outcomes and store failures in memory.
#[derive(Debug, Default)]
pub struct CapturingSink {
    outcomes: Mutex<Vec<DeliveryOutcome>>,
    store_failures: Mutex<u64>,
}

impl CapturingSink {
    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.outcomes
            .lock()
            .map(|outcomes| outcomes.clone())
            .unwrap_or_default()
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.lock().map(|count| *count).unwrap_or(0)
    }
}

impl MetricsSink for CapturingSink {
    fn queue_stats(&self, _stats: &QueueStats) {}

    fn delivery_outcome(&self, outcome: DeliveryOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(outcome);
        }
    }

    fn dispatch_latency(&self, _elapsed: Duration, _status_class: &'static str) {}
    fn queue_error(&self, _operation: &'static str) {}
    fn jobs_promoted(&self, _count: u64) {}
    fn leases_reclaimed(&self, _count: u64) {}

    fn rate_limit_store_failure(&self, _policy: &'static str) {
        if let Ok(mut count) = self.store_failures.lock() {
            *count += 1;
        }
    }

    fn event_ingested(&self, _outcome: &'static str, _deliveries: usize) {}
    fn endpoint_deactivated(&self) {}
}

/// Status class label for a dispatch result.
pub fn status_class(status: Option<u16>) -> &'static str {
    match status {
        Some(200..=299) => "2xx",
        Some(300..=399) => "3xx",
        Some(400..=499) => "4xx",
        Some(_) => "5xx",
        None => "error",
    }
}
