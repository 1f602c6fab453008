use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Error;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default)]
pub struct ClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub redirects: u64,
    pub auth_retries: u64,
    pub retry_capacity_exhausted: u64,
    pub send_token_rejections: u64,
    pub client_execution_timeouts: u64,
    pub request_timeouts: u64,
    pub transport_errors: u64,
    pub service_errors: u64,
    pub throttling_errors: u64,
    pub reset_stream_failures: u64,
    pub clock_skew_adjustments: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Arc<ClientMetricsInner>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    redirects: AtomicU64,
    auth_retries: AtomicU64,
    retry_capacity_exhausted: AtomicU64,
    send_token_rejections: AtomicU64,
    client_execution_timeouts: AtomicU64,
    request_timeouts: AtomicU64,
    transport_errors: AtomicU64,
    service_errors: AtomicU64,
    throttling_errors: AtomicU64,
    reset_stream_failures: AtomicU64,
    clock_skew_adjustments: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: ClientMetrics,
}

impl ClientMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redirect(&self) {
        self.inner.redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auth_retry(&self) {
        self.inner.auth_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry_capacity_exhausted(&self) {
        self.inner
            .retry_capacity_exhausted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttling_error(&self) {
        self.inner.throttling_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clock_skew_adjustment(&self) {
        self.inner
            .clock_skew_adjustments
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_status(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    pub(crate) fn record_request_succeeded(&self, latency: Duration) {
        self.inner
            .requests_succeeded
            .fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub(crate) fn record_request_failed(&self, error: &Error, latency: Duration) {
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
        let counter = match error {
            Error::ClientExecutionTimeout { .. } => Some(&self.inner.client_execution_timeouts),
            Error::RequestTimeout { .. } => Some(&self.inner.request_timeouts),
            Error::Transport { .. } => Some(&self.inner.transport_errors),
            Error::Service(_) => Some(&self.inner.service_errors),
            Error::SendTokenUnavailable { .. } => Some(&self.inner.send_token_rejections),
            Error::ResetStream { .. } => Some(&self.inner.reset_stream_failures),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let error_key = match error {
            Error::Transport { kind, .. } => format!("transport:{kind}"),
            Error::Service(service_error) => format!(
                "service:{}",
                service_error.error_code().unwrap_or("unknown")
            ),
            other => other.code().as_str().to_owned(),
        };
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;
        let latency_samples = load(&inner.latency_samples);
        let latency_total_ms = load(&inner.latency_total_ms);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        ClientMetricsSnapshot {
            requests_started: load(&inner.requests_started),
            requests_succeeded: load(&inner.requests_succeeded),
            requests_failed: load(&inner.requests_failed),
            attempts: load(&inner.attempts),
            retries: load(&inner.retries),
            redirects: load(&inner.redirects),
            auth_retries: load(&inner.auth_retries),
            retry_capacity_exhausted: load(&inner.retry_capacity_exhausted),
            send_token_rejections: load(&inner.send_token_rejections),
            client_execution_timeouts: load(&inner.client_execution_timeouts),
            request_timeouts: load(&inner.request_timeouts),
            transport_errors: load(&inner.transport_errors),
            service_errors: load(&inner.service_errors),
            throttling_errors: load(&inner.throttling_errors),
            reset_stream_failures: load(&inner.reset_stream_failures),
            clock_skew_adjustments: load(&inner.clock_skew_adjustments),
            in_flight: load(&inner.in_flight),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Method;

    use super::ClientMetrics;
    use crate::error::{Error, ServiceError};

    #[test]
    fn failures_are_bucketed_by_kind() {
        let metrics = ClientMetrics::default();
        metrics.record_request_started();
        metrics.record_request_failed(
            &ServiceError::new(503, "slow down").with_error_code("SlowDown").into(),
            Duration::from_millis(5),
        );
        metrics.record_request_failed(
            &Error::ClientExecutionTimeout {
                timeout_ms: 10,
                method: Method::GET,
                uri: "https://cos.example.com/".to_owned(),
            },
            Duration::from_millis(15),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_failed, 2);
        assert_eq!(snapshot.service_errors, 1);
        assert_eq!(snapshot.client_execution_timeouts, 1);
        assert_eq!(snapshot.error_counts.get("service:SlowDown"), Some(&1));
        assert_eq!(snapshot.error_counts.get("client_execution_timeout"), Some(&1));
        assert_eq!(snapshot.latency_avg_ms, 10.0);
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let metrics = ClientMetrics::default();
        let guard = metrics.enter_in_flight();
        assert_eq!(metrics.snapshot().in_flight, 1);
        drop(guard);
        assert_eq!(metrics.snapshot().in_flight, 0);
    }
}
