//! Metrics for work queue monitoring.
//!
//! Recorded through the `metrics` facade; install any recorder (for
//! example a Prometheus exporter) to collect them.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs published by `send`.
    pub const JOBS_SENT_TOTAL: &str = "hutch_jobs_sent_total";
    /// Total deliveries handed to a handler.
    pub const JOBS_DELIVERED_TOTAL: &str = "hutch_jobs_delivered_total";
    /// Total jobs whose handler succeeded.
    pub const JOBS_COMPLETED_TOTAL: &str = "hutch_jobs_completed_total";
    /// Total failed deliveries.
    pub const JOBS_FAILED_TOTAL: &str = "hutch_jobs_failed_total";
    /// Total retries scheduled through the wait queue.
    pub const JOBS_RETRIED_TOTAL: &str = "hutch_jobs_retried_total";
    /// Total jobs moved to the failed queue.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "hutch_jobs_dead_lettered_total";

    /// Deliveries currently being handled.
    pub const JOBS_IN_FLIGHT: &str = "hutch_jobs_in_flight";
    /// Whether the queue holds a live broker connection.
    pub const BROKER_CONNECTED: &str = "hutch_broker_connected";

    /// Handler duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "hutch_job_duration_seconds";
    /// Scheduled retry delay in seconds.
    pub const JOB_RETRY_DELAY_SECONDS: &str = "hutch_job_retry_delay_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_SENT_TOTAL, "Total number of jobs sent");
    describe_counter!(
        names::JOBS_DELIVERED_TOTAL,
        "Total number of deliveries handed to a handler"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of failed deliveries");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of job retries");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs moved to the failed queue"
    );

    describe_gauge!(names::JOBS_IN_FLIGHT, "Deliveries currently being handled");
    describe_gauge!(
        names::BROKER_CONNECTED,
        "Whether the work queue is connected (1) or not (0)"
    );

    describe_histogram!(names::JOB_DURATION_SECONDS, "Handler duration in seconds");
    describe_histogram!(
        names::JOB_RETRY_DELAY_SECONDS,
        "Delay before a scheduled retry in seconds"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job sent.
    pub fn job_sent(component: &str, worker: &str, priority: &str, delayed: bool) {
        counter!(
            names::JOBS_SENT_TOTAL,
            "component" => component.to_string(),
            "worker" => worker.to_string(),
            "priority" => priority.to_string(),
            "delayed" => delayed.to_string()
        )
        .increment(1);
    }

    /// Record a delivery handed to a handler.
    pub fn job_delivered(component: &str, worker: &str) {
        counter!(
            names::JOBS_DELIVERED_TOTAL,
            "component" => component.to_string(),
            "worker" => worker.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(component: &str, worker: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "component" => component.to_string(),
            "worker" => worker.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "component" => component.to_string(),
            "worker" => worker.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed delivery.
    pub fn job_failed(component: &str, worker: &str, error_type: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "component" => component.to_string(),
            "worker" => worker.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "component" => component.to_string(),
            "worker" => worker.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a retry scheduled.
    pub fn job_retried(component: &str, worker: &str, delay_ms: u64) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "component" => component.to_string(),
            "worker" => worker.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_RETRY_DELAY_SECONDS,
            "component" => component.to_string(),
            "worker" => worker.to_string()
        )
        .record(Duration::from_millis(delay_ms).as_secs_f64());
    }

    /// Record a job moved to the failed queue.
    pub fn job_dead_lettered(component: &str, worker: &str, reason: &str) {
        counter!(
            names::JOBS_DEAD_LETTERED_TOTAL,
            "component" => component.to_string(),
            "worker" => worker.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Update the in-flight gauge.
    pub fn update_in_flight(component: &str, in_flight: usize) {
        gauge!(
            names::JOBS_IN_FLIGHT,
            "component" => component.to_string()
        )
        .set(in_flight as f64);
    }

    /// Update connection status.
    pub fn update_connected(component: &str, connected: bool) {
        gauge!(
            names::BROKER_CONNECTED,
            "component" => component.to_string()
        )
        .set(if connected { 1.0 } else { 0.0 });
    }
}

/// Short label for an error, used as the `error_type` metric label.
pub(crate) fn error_type(err: &crate::JobError) -> &'static str {
    use crate::JobError;
    match err {
        JobError::InvalidConfiguration(_) => "invalid_configuration",
        JobError::NotConnected { .. } => "not_connected",
        JobError::UnknownWorker(_) => "unknown_worker",
        JobError::HandlerFailure(_) => "handler",
        JobError::Transport(_) => "transport",
        JobError::MalformedEnvelope(_) => "malformed_envelope",
        JobError::Serialization(_) => "serialization",
        JobError::InvalidState { .. } => "invalid_state",
        JobError::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobError;

    #[test]
    fn test_register_metrics() {
        // Just verify registration doesn't panic
        register_metrics();
    }

    #[test]
    fn test_job_metrics() {
        JobMetrics::job_sent("mailer", "welcome", "normal", false);
        JobMetrics::job_delivered("mailer", "welcome");
        JobMetrics::job_completed("mailer", "welcome", Duration::from_secs(1));
        JobMetrics::job_failed("mailer", "welcome", "handler", Duration::from_millis(5));
        JobMetrics::job_retried("mailer", "welcome", 1500);
        JobMetrics::update_in_flight("mailer", 3);
    }

    #[test]
    fn test_error_type_labels() {
        assert_eq!(error_type(&JobError::handler("x")), "handler");
        assert_eq!(error_type(&JobError::UnknownWorker("w".into())), "unknown_worker");
    }
}
