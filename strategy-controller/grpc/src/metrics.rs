use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

pub(crate) const TRANSPORT: &str = "transport";
pub(crate) const DISCOVERY: &str = "discovery";

#[derive(Clone, Debug, Default)]
pub struct PushMetrics {
    pushes: Family<PushLabels, Counter>,
    connections: Family<ProtocolLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PushLabels {
    protocol: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProtocolLabels {
    protocol: &'static str,
}

/// Decrements the connection gauge when dropped.
#[derive(Debug)]
pub(crate) struct ConnectionGuard(Gauge);

// === impl PushMetrics ===

impl PushMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let pushes = Family::<PushLabels, Counter>::default();
        reg.register(
            "pushes",
            "Total number of rule pushes sent to clients",
            pushes.clone(),
        );

        let connections = Family::<ProtocolLabels, Gauge>::default();
        reg.register(
            "connections",
            "Number of open client streams",
            connections.clone(),
        );

        Self {
            pushes,
            connections,
        }
    }

    pub(crate) fn pushed(&self, protocol: &'static str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.pushes
            .get_or_create(&PushLabels { protocol, result })
            .inc();
    }

    pub(crate) fn connection_opened(&self, protocol: &'static str) -> ConnectionGuard {
        let gauge = self
            .connections
            .get_or_create(&ProtocolLabels { protocol })
            .clone();
        gauge.inc();
        ConnectionGuard(gauge)
    }

    #[cfg(test)]
    pub(crate) fn push_count(&self, protocol: &'static str, ok: bool) -> u64 {
        let result = if ok { "ok" } else { "error" };
        self.pushes
            .get_or_create(&PushLabels { protocol, result })
            .get()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}
