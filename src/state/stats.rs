use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters for one proxy run.
///
/// Each collector owns its registry so a restarted proxy starts from zero and
/// parallel test instances never collide on metric names.
pub struct StatsCollector {
    registry: Registry,
    started_at: DateTime<Utc>,

    // Capture metrics
    pub captured_total: IntCounter,
    pub capture_errors: IntCounter,

    // Connection metrics
    pub connections_total: IntCounter,
    pub active_connections: IntGauge,
    pub connection_errors: IntCounter,

    // Tunnel metrics
    pub intercepted_tunnels: IntCounter,
    pub passthrough_tunnels: IntCounter,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        let registry = Registry::new();

        let captured_total = IntCounter::new(
            "termtap_captured_total",
            "Total number of captured transactions",
        )
        .expect("metric creation failed");
        let capture_errors = IntCounter::new(
            "termtap_capture_errors_total",
            "Captured transactions that carry an error",
        )
        .expect("metric creation failed");

        let connections_total = IntCounter::new(
            "termtap_connections_total",
            "Total number of accepted client connections",
        )
        .expect("metric creation failed");
        let active_connections = IntGauge::new(
            "termtap_active_connections",
            "Number of open client connections",
        )
        .expect("metric creation failed");
        let connection_errors = IntCounter::new(
            "termtap_connection_errors_total",
            "Client connections that ended with an error",
        )
        .expect("metric creation failed");

        let intercepted_tunnels = IntCounter::new(
            "termtap_intercepted_tunnels_total",
            "CONNECT tunnels terminated for inspection",
        )
        .expect("metric creation failed");
        let passthrough_tunnels = IntCounter::new(
            "termtap_passthrough_tunnels_total",
            "CONNECT tunnels relayed as raw bytes",
        )
        .expect("metric creation failed");

        for collector in [
            Box::new(captured_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(capture_errors.clone()),
            Box::new(connections_total.clone()),
            Box::new(active_connections.clone()),
            Box::new(connection_errors.clone()),
            Box::new(intercepted_tunnels.clone()),
            Box::new(passthrough_tunnels.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registration failed");
        }

        Self {
            registry,
            started_at: Utc::now(),
            captured_total,
            capture_errors,
            connections_total,
            active_connections,
            connection_errors,
            intercepted_tunnels,
            passthrough_tunnels,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    pub fn record_capture(&self, failed: bool) {
        self.captured_total.inc();
        if failed {
            self.capture_errors.inc();
        }
    }

    pub fn connection_opened(&self) -> ConnectionGuard<'_> {
        self.connections_total.inc();
        self.active_connections.inc();
        ConnectionGuard { stats: self }
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.inc();
    }

    pub fn record_tunnel(&self, intercepted: bool) {
        if intercepted {
            self.intercepted_tunnels.inc();
        } else {
            self.passthrough_tunnels.inc();
        }
    }

    pub fn captured(&self) -> u64 {
        self.captured_total.get()
    }

    pub fn errors(&self) -> u64 {
        self.capture_errors.get()
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// All counters in the Prometheus text format.
    pub fn render_metrics(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Decrements the active connection gauge when the connection task ends.
pub struct ConnectionGuard<'a> {
    stats: &'a StatsCollector,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.stats.active_connections.dec();
    }
}
