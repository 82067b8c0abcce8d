use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::binding::{BindError, Header};

/// Binding metrics collector
#[derive(Clone)]
pub struct BindingMetrics {
    /// Attach / detach outcomes per header
    pub operations_total: CounterVec,
    /// Bindings currently committed in the index
    pub active_bindings: GaugeVec,
}

impl BindingMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let operations_total = CounterVec::new(
            Opts::new("hostbind_operations_total", "Total bind operations by outcome"),
            &["operation", "api", "namespace", "outcome"],
        )?;

        let active_bindings = GaugeVec::new(
            Opts::new("hostbind_active_bindings", "Number of live bindings"),
            &["api", "namespace"],
        )?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(active_bindings.clone()))?;

        Ok(Self { operations_total, active_bindings })
    }

    /// Record one per-target outcome
    pub fn record(&self, operation: &str, header: &Header, result: Result<(), &BindError>) {
        let outcome = match result {
            Ok(()) => "ok",
            Err(err) => err.kind(),
        };
        self.operations_total
            .with_label_values(&[operation, header.api.as_str(), header.namespace.as_str(), outcome])
            .inc();
    }

    pub fn bound(&self, header: &Header, count: usize) {
        self.active_bindings
            .with_label_values(&[header.api.as_str(), header.namespace.as_str()])
            .add(count as f64);
    }

    pub fn released(&self, header: &Header, count: usize) {
        self.active_bindings
            .with_label_values(&[header.api.as_str(), header.namespace.as_str()])
            .sub(count as f64);
    }
}

/// Everything in `registry`, in the Prometheus text exposition format.
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
