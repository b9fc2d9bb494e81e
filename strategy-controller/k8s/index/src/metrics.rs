use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use strategy_controller_core::ResourceKind;

/// Metrics shared by every watcher and cache. Clones share the same
/// underlying metrics.
#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    watchers: Gauge,
    cache_mutations: Family<MutationLabels, Counter>,
    ignored_events: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct MutationLabels {
    kind: String,
    op: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "watchers",
            "Gauge of the number of active resource watchers",
            metrics.watchers.clone(),
        );
        prom.register(
            "cache_mutations",
            "Count of mutations applied to resource caches",
            metrics.cache_mutations.clone(),
        );
        prom.register(
            "ignored_events",
            "Count of resource events ignored because no client subscribes to them",
            metrics.ignored_events.clone(),
        );
        metrics
    }

    pub(crate) fn watcher_created(&self) {
        self.watchers.inc();
    }

    pub(crate) fn cache_set(&self, kind: &ResourceKind) {
        self.mutation(kind, "set");
    }

    pub(crate) fn cache_delete(&self, kind: &ResourceKind) {
        self.mutation(kind, "delete");
    }

    pub(crate) fn event_ignored(&self, kind: &ResourceKind) {
        self.ignored_events
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    fn mutation(&self, kind: &ResourceKind, op: &'static str) {
        self.cache_mutations
            .get_or_create(&MutationLabels {
                kind: kind.to_string(),
                op,
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn watchers(&self) -> i64 {
        self.watchers.get()
    }
}
