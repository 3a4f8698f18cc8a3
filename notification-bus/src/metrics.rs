//! Prometheus metrics for notification bus

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

lazy_static! {
    /// Notifications handed to a sink, by event and outcome (queued/dropped)
    pub static ref NOTIFICATION_ENQUEUE_TOTAL: CounterVec = register_counter_vec!(
        "notification_bus_enqueue_total",
        "Total notifications handed to the sink",
        &["event", "status"]
    )
    .unwrap();

    /// Delivery attempts to the monitoring endpoint, by event and outcome
    pub static ref NOTIFICATION_DELIVERY_TOTAL: CounterVec = register_counter_vec!(
        "notification_bus_delivery_total",
        "Total notification deliveries",
        &["event", "status"]
    )
    .unwrap();

    /// Delivery duration including retries
    pub static ref NOTIFICATION_DELIVERY_DURATION: HistogramVec = register_histogram_vec!(
        "notification_bus_delivery_duration_seconds",
        "Notification delivery duration in seconds",
        &["event"]
    )
    .unwrap();
}
