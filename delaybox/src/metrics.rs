use delaybox_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for a [DelayBoxDevice](crate::device::DelayBoxDevice).
#[derive(Default, Clone)]
pub struct Metrics {
    /// Number of packets accepted for delivery
    pub enqueued_packets: Counter,

    /// Number of packets dropped by a flow's loss rate
    pub dropped_packets: Counter,

    /// Number of bytes accepted for delivery
    pub enqueued_bytes: Counter,

    /// Number of packets waiting on a flow's timeline
    pub in_flight_packets: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "delaybox_enqueued_packets",
            "Number of packets accepted for delivery",
            metrics.enqueued_packets.clone(),
        );
        context.register(
            "delaybox_dropped_packets",
            "Number of packets dropped by a flow's loss rate",
            metrics.dropped_packets.clone(),
        );
        context.register(
            "delaybox_enqueued_bytes",
            "Number of bytes accepted for delivery",
            metrics.enqueued_bytes.clone(),
        );
        context.register(
            "delaybox_in_flight_packets",
            "Number of packets waiting on a flow's timeline",
            metrics.in_flight_packets.clone(),
        );
        metrics
    }
}
