// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process counters exposed at `/metrics`.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Atomic API-level counters shared across handlers.
#[derive(Default)]
pub struct ApiMetrics {
    api_errors_total: AtomicU64,
    jobs_submitted_total: AtomicU64,
    jobs_completed_total: AtomicU64,
    jobs_failed_total: AtomicU64,
}

impl ApiMetrics {
    /// Create a zeroed collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one unhandled handler failure.
    pub fn record_api_error(&self) {
        self.api_errors_total.fetch_add(1, Relaxed);
    }

    /// Count one accepted submission.
    pub fn record_submission(&self) {
        self.jobs_submitted_total.fetch_add(1, Relaxed);
    }

    /// Count one job reaching `Completed`.
    pub fn record_completion(&self) {
        self.jobs_completed_total.fetch_add(1, Relaxed);
    }

    /// Count one job reaching `Failed`.
    pub fn record_failure(&self) {
        self.jobs_failed_total.fetch_add(1, Relaxed);
    }

    /// Point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            api_errors_total: self.api_errors_total.load(Relaxed),
            jobs_submitted_total: self.jobs_submitted_total.load(Relaxed),
            jobs_completed_total: self.jobs_completed_total.load(Relaxed),
            jobs_failed_total: self.jobs_failed_total.load(Relaxed),
        }
    }
}

/// Non-atomic, serialisable snapshot of [`ApiMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Unhandled handler failures (HTTP 5xx).
    pub api_errors_total: u64,
    /// Accepted submissions.
    pub jobs_submitted_total: u64,
    /// Jobs that reached `Completed`.
    pub jobs_completed_total: u64,
    /// Jobs that reached `Failed`.
    pub jobs_failed_total: u64,
}

/// Middleware counting server-error responses into `api_errors_total`.
pub async fn count_server_errors(
    State(state): State<Arc<crate::AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if response.status().is_server_error() {
        state.metrics.record_api_error();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_snapshot() {
        let metrics = ApiMetrics::new();
        metrics.record_api_error();
        metrics.record_submission();
        metrics.record_submission();
        metrics.record_completion();
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.api_errors_total, 1);
        assert_eq!(snapshot.jobs_submitted_total, 2);
        assert_eq!(snapshot.jobs_completed_total, 1);
        assert_eq!(snapshot.jobs_failed_total, 1);
    }
}
