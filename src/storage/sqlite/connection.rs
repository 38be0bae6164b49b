//! Connection handling shared by the stores.

use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// A poisoned lock is logged and counted in
/// `sqlite_mutex_poison_recovery_total`.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Store mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Applies WAL journaling, NORMAL synchronous mode and a 5 second busy
/// timeout.
///
/// Pragma results are ignored: `journal_mode` answers with a row, and
/// in-memory databases keep the `memory` journal.
pub fn configure_connection(conn: &Connection) {
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
    let _ = conn.pragma_update(None, "foreign_keys", "ON");
}

/// Records `storage_operations_total` and `storage_operation_duration_ms`
/// for one store call.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        let mut guard = acquire_lock(&mutex);
        *guard += 1;
        assert_eq!(*guard, 2);
    }

    #[test]
    fn test_configure_connection() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn);

        let synchronous: i32 = conn
            .pragma_query_value(None, "synchronous", |row| row.get(0))
            .unwrap();
        assert_eq!(synchronous, 1);

        let busy_timeout: i32 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(busy_timeout, 5000);
    }

    #[test]
    fn test_record_metrics_without_recorder() {
        record_operation_metrics("sqlite", "get_topic", Instant::now(), "success");
    }
}
