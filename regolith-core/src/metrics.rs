use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use regolith_config::Action;

/// Prometheus collectors for the proxy, registered once per process.
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    decisions_total: IntCounterVec,
    bytes_transferred: IntCounterVec,
    errors_total: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "regolith_connections_total",
                "Total number of requests handled by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::new(
            "regolith_connections_active",
            "Number of client connections currently open",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let decisions_total = IntCounterVec::new(
            Opts::new(
                "regolith_decisions_total",
                "Permission decisions by resulting action",
            ),
            &["action"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "regolith_bytes_transferred_total",
                "Total tunnelled bytes by direction",
            ),
            &["direction"],
        )?;
        registry.register(Box::new(bytes_transferred.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("regolith_errors_total", "Total number of errors by type"),
            &["error_type"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            connections_total,
            connections_active,
            decisions_total,
            bytes_transferred,
            errors_total,
        })
    }

    /// `kind` is `connect` or `forward`.
    pub fn request(&self, kind: &str) {
        self.connections_total.with_label_values(&[kind]).inc();
    }

    pub fn connection_opened(&self) {
        self.connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn decision(&self, action: Action) {
        self.decisions_total
            .with_label_values(&[action.as_str()])
            .inc();
    }

    pub fn error(&self, error_type: &str) {
        self.errors_total.with_label_values(&[error_type]).inc();
    }

    /// Counters for (client to upstream, upstream to client).
    pub fn tunnel_counters(&self) -> (IntCounter, IntCounter) {
        (
            self.bytes_transferred.with_label_values(&["tx"]),
            self.bytes_transferred.with_label_values(&["rx"]),
        )
    }
}
