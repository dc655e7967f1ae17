//! Storage metrics recorded through the `metrics` facade.
//!
//! No exporter is installed here; the embedding application picks one.

use std::time::Instant;

/// Operation outcome label.
#[must_use]
pub const fn status_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() { "success" } else { "error" }
}

/// Records operation metrics for storage operations.
///
/// This function records two metrics for each operation:
/// 1. `storage_operations_total` - Counter for operation count by status
/// 2. `storage_operation_duration_ms` - Histogram for operation latency
///
/// # Examples
///
/// ```ignore
/// use std::time::Instant;
/// use polystore::observability::record_operation_metrics;
///
/// let start = Instant::now();
/// // ... perform operation ...
/// record_operation_metrics("sqlite", "find", start, status_label(&result));
/// ```
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records a reconnect attempt and its outcome.
pub fn record_reconnect(backend: &'static str, status: &'static str) {
    metrics::counter!(
        "storage_reconnects_total",
        "backend" => backend,
        "status" => status
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_status_label() {
        assert_eq!(status_label(&Ok::<(), ()>(())), "success");
        assert_eq!(status_label(&Err::<(), ()>(())), "error");
    }

    #[test]
    fn test_record_operation_metrics_timing() {
        let start = Instant::now();
        thread::sleep(Duration::from_millis(10));

        record_operation_metrics("sqlite", "find", start, "success");

        assert!(start.elapsed().as_millis() >= 10);
    }

    #[test]
    fn test_record_from_many_threads() {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let status = if i % 2 == 0 { "success" } else { "error" };
                thread::spawn(move || {
                    record_operation_metrics("sqlite", "update", Instant::now(), status);
                    record_reconnect("mongodb", status);
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("Thread panicked");
        }
    }
}
