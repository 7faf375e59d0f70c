use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::EngineResult;

lazy_static! {
    // Scheduler Metrics
    pub static ref SCHEDULED_TASKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scheduled_tasks_total",
        "Total number of tasks admitted by the rate-limit scheduler",
        &["provider"]
    )
    .unwrap();

    pub static ref SCHEDULER_BUDGET_WAITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scheduler_budget_waits_total",
        "Number of times a task waited for an exhausted token budget",
        &["provider"]
    )
    .unwrap();

    pub static ref SCHEDULER_WAIT_SECONDS: Histogram = register_histogram!(
        "scheduler_wait_seconds",
        "Time spent waiting for a token budget reset",
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    // Generation Metrics
    pub static ref GENERATION_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "generation_attempts_total",
        "Structured generation attempts",
        &["task", "outcome"]
    )
    .unwrap();

    pub static ref QUESTION_FALLBACKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "question_fallbacks_total",
        "Fallback questions served after generation gave up",
        &["task"]
    )
    .unwrap();

    pub static ref VALIDATION_DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "validation_decisions_total",
        "Validator verdicts on generated questions",
        &["decision"]
    )
    .unwrap();

    // Answer Metrics
    pub static ref ANSWERS_SCORED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answers_scored_total",
        "Total number of answers scored",
        &["outcome"]
    )
    .unwrap();

    // Persistence Metrics
    pub static ref STORE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "store_operations_total",
        "Total number of progress store operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref STORE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "store_operation_duration_seconds",
        "Progress store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    // Offline Queue Metrics
    pub static ref OFFLINE_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "offline_queue_depth",
        "Number of writes waiting in the offline queue"
    )
    .unwrap();

    pub static ref OFFLINE_QUEUE_SYNC_TOTAL: IntCounterVec = register_int_counter_vec!(
        "offline_queue_sync_total",
        "Offline queue entries processed during sync",
        &["result"]
    )
    .unwrap();

    pub static ref QUEUE_SYNC_WORKER_TICKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "queue_sync_worker_ticks_total",
        "Total number of queue sync worker ticks",
        &["status"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track progress store operation with metrics
pub async fn track_store_operation<F, T>(operation: &str, future: F) -> EngineResult<T>
where
    F: std::future::Future<Output = EngineResult<T>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    STORE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();

    STORE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration);

    result
}

pub fn record_answer(outcome: &str) {
    ANSWERS_SCORED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_generation_attempt(task: &str, outcome: &str) {
    GENERATION_ATTEMPTS_TOTAL
        .with_label_values(&[task, outcome])
        .inc();
}

pub fn record_fallback(task: &str) {
    QUESTION_FALLBACKS_TOTAL.with_label_values(&[task]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = SCHEDULED_TASKS_TOTAL.with_label_values(&["cerebras"]).get();
        let _ = OFFLINE_QUEUE_DEPTH.get();
    }

    #[test]
    fn test_render_metrics() {
        record_answer("correct");
        record_generation_attempt("initial", "success");

        let output = render_metrics().unwrap();
        assert!(output.contains("answers_scored_total"));
        assert!(output.contains("generation_attempts_total"));
    }

    #[tokio::test]
    async fn test_track_store_operation_counts_errors() {
        let result: EngineResult<()> = track_store_operation("failing_read", async {
            Err(crate::error::EngineError::PersistenceRead("down".into()))
        })
        .await;

        assert!(result.is_err());
        let errors = STORE_OPERATIONS_TOTAL
            .with_label_values(&["failing_read", "error"])
            .get();
        assert!(errors >= 1);
    }
}
