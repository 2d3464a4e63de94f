//! Metrics Collector

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

use crate::holding::Direction;
use crate::relay::PacketKind;

/// Collects and exports relay metrics
pub struct Metrics {
    registry: Registry,
    packets_total: IntCounterVec,
    bytes_total: IntCounterVec,
    pending_packets: IntGauge,
    connect_attempts_total: IntCounter,
    send_failures_total: IntCounter,
    sessions_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let registry = Registry::new();

        let packets_total = IntCounterVec::new(
            Opts::new(
                "packetholder_packets_total",
                "Packets handled by the relay, by direction and outcome",
            ),
            &["direction", "kind"],
        )
        .expect("Failed to create packets_total counter");

        let bytes_total = IntCounterVec::new(
            Opts::new(
                "packetholder_bytes_total",
                "Bytes read from each side of the relay",
            ),
            &["direction"],
        )
        .expect("Failed to create bytes_total counter");

        let pending_packets = IntGauge::new(
            "packetholder_pending_packets",
            "Packets currently withheld from the upstream server",
        )
        .expect("Failed to create pending_packets gauge");

        let connect_attempts_total = IntCounter::new(
            "packetholder_upstream_connect_attempts_total",
            "Upstream connection attempts",
        )
        .expect("Failed to create connect_attempts_total counter");

        let send_failures_total = IntCounter::new(
            "packetholder_send_failures_total",
            "Packets that could not be written to their destination",
        )
        .expect("Failed to create send_failures_total counter");

        let sessions_total = IntCounter::new(
            "packetholder_sessions_total",
            "Relay sessions that reached the running state",
        )
        .expect("Failed to create sessions_total counter");

        registry
            .register(Box::new(packets_total.clone()))
            .expect("Failed to register packets_total");
        registry
            .register(Box::new(bytes_total.clone()))
            .expect("Failed to register bytes_total");
        registry
            .register(Box::new(pending_packets.clone()))
            .expect("Failed to register pending_packets");
        registry
            .register(Box::new(connect_attempts_total.clone()))
            .expect("Failed to register connect_attempts_total");
        registry
            .register(Box::new(send_failures_total.clone()))
            .expect("Failed to register send_failures_total");
        registry
            .register(Box::new(sessions_total.clone()))
            .expect("Failed to register sessions_total");

        Self {
            registry,
            packets_total,
            bytes_total,
            pending_packets,
            connect_attempts_total,
            send_failures_total,
            sessions_total,
        }
    }

    pub fn record_packet(&self, direction: Direction, kind: PacketKind) {
        self.packets_total
            .with_label_values(&[direction_label(direction), kind.as_str()])
            .inc();
    }

    pub fn record_bytes(&self, direction: Direction, bytes: usize) {
        self.bytes_total
            .with_label_values(&[direction_label(direction)])
            .inc_by(bytes as u64);
    }

    pub fn set_pending(&self, pending: usize) {
        self.pending_packets.set(pending as i64);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts_total.inc();
    }

    pub fn record_send_failure(&self) {
        self.send_failures_total.inc();
    }

    pub fn record_session(&self) {
        self.sessions_total.inc();
    }

    pub fn packets(&self, direction: Direction, kind: PacketKind) -> u64 {
        self.packets_total
            .with_label_values(&[direction_label(direction), kind.as_str()])
            .get()
    }

    pub fn pending(&self) -> i64 {
        self.pending_packets.get()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts_total.get()
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures_total.get()
    }

    pub fn sessions(&self) -> u64 {
        self.sessions_total.get()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        match encoder.encode_to_string(&metric_families) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode Prometheus metrics: {}", e);
                String::new()
            }
        }
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::ClientToServer => "client_to_server",
        Direction::ServerToClient => "server_to_client",
    }
}
