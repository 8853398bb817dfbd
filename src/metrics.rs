//! Metrics and tracing helpers
//!
//! Instruments are registered on the global `opentelemetry` meter provider;
//! the application decides where they are exported.

#[cfg(feature = "metrics")]
pub use self::instruments::{KeelMetrics, METRICS};

#[cfg(feature = "metrics")]
mod instruments {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram},
        KeyValue,
    };
    use std::time::Duration;

    pub static METRICS: Lazy<KeelMetrics> = Lazy::new(KeelMetrics::init);

    pub struct KeelMetrics {
        pub changesets_applied_total: Counter<u64>,
        pub changeset_failures_total: Counter<u64>,
        pub changeset_duration: Histogram<f64>,
        pub lock_wait_duration: Histogram<f64>,
        pub lock_timeouts_total: Counter<u64>,
    }

    impl KeelMetrics {
        pub fn init() -> Self {
            let meter = global::meter("keel");

            let changesets_applied_total = meter
                .u64_counter("keel_changesets_applied_total")
                .with_description("Changesets applied and recorded in the history table")
                .build();

            let changeset_failures_total = meter
                .u64_counter("keel_changeset_failures_total")
                .with_description("Changesets whose SQL failed to apply")
                .build();

            let changeset_duration = meter
                .f64_histogram("keel_changeset_duration_seconds")
                .with_description("Time spent executing one changeset's statements")
                .build();

            let lock_wait_duration = meter
                .f64_histogram("keel_lock_wait_seconds")
                .with_description("Time spent waiting for the migration lock")
                .build();

            let lock_timeouts_total = meter
                .u64_counter("keel_lock_timeouts_total")
                .with_description("Lock acquisitions that gave up after the configured timeout")
                .build();

            Self {
                changesets_applied_total,
                changeset_failures_total,
                changeset_duration,
                lock_wait_duration,
                lock_timeouts_total,
            }
        }

        pub fn record_changeset(&self, vendor: &str, elapsed: Duration) {
            let attrs = [KeyValue::new("vendor", vendor.to_string())];
            self.changesets_applied_total.add(1, &attrs);
            self.changeset_duration.record(elapsed.as_secs_f64(), &attrs);
        }

        pub fn record_changeset_failure(&self, vendor: &str) {
            self.changeset_failures_total
                .add(1, &[KeyValue::new("vendor", vendor.to_string())]);
        }

        pub fn record_lock_wait(&self, elapsed: Duration) {
            self.lock_wait_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_lock_timeout(&self) {
            self.lock_timeouts_total.add(1, &[]);
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    /// Span around one full migration run
    pub fn migration_run_span(vendor: &str, change_sets: usize) -> Span {
        info_span!("keel.migrate", vendor = vendor, change_sets = change_sets)
    }

    /// Span around applying one changeset
    pub fn changeset_span(identity: &str) -> Span {
        info_span!("keel.changeset", identity = identity)
    }

    /// Span around lock acquisition, including any waiting
    pub fn lock_acquire_span(holder_id: &str) -> Span {
        info_span!("keel.lock.acquire", holder_id = holder_id)
    }

    pub fn execute_statement_span(sql: &str) -> Span {
        let summary: String = sql.trim().chars().take(64).collect();
        info_span!("keel.db.execute", statement = %summary)
    }

    pub fn connect_span() -> Span {
        info_span!("keel.db.connect")
    }
}
