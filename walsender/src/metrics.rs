//! Process-wide Prometheus metrics, registered once and updated from the
//! streaming loop and the slot table. Grounded on the `Lazy` +
//! `register_*!` pattern used throughout the teacher's own metrics module,
//! depending on `prometheus` directly rather than its internal wrapper
//! crate (see DESIGN.md).

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, register_int_gauge_vec,
    Histogram, IntCounter, IntGauge, IntGaugeVec,
};

pub static SENT_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wal_sender_sent_bytes_total",
        "Total bytes of WAL sent to standbys"
    )
    .expect("failed to register wal_sender_sent_bytes_total")
});

pub static SEND_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "wal_sender_send_seconds",
        "Time spent in a single send of WAL to a standby",
        vec![
            0.000_1, 0.000_5, 0.001, 0.003, 0.005, 0.01, 0.03, 0.05, 0.1, 0.3, 0.5, 1.0, 3.0
        ]
    )
    .expect("failed to register wal_sender_send_seconds")
});

pub static ACTIVE_SENDERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("wal_sender_active", "Number of occupied sender slots")
        .expect("failed to register wal_sender_active")
});

pub static CAUGHT_UP: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "wal_sender_caught_up",
        "1 if the sender in this slot has sent all flushed WAL, else 0",
        &["slot"]
    )
    .expect("failed to register wal_sender_caught_up")
});

pub fn record_sent(bytes: usize) {
    SENT_BYTES_TOTAL.inc_by(bytes as u64);
}
