use crate::{
    core::{NamespacedName, ResourceKind},
    index::{KindMetadata, ResourceWatcher, WatchResources},
    k8s::{DynamicObject, Event, Labels, ResourceExt, Watch},
};
use ahash::AHashSet as HashSet;
use kube::runtime::{watcher, WatchStreamExt};
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

/// Watches strategy resources across all namespaces of the cluster.
#[derive(Clone)]
pub struct ClusterWatches {
    client: kube::Client,
}

// === impl ClusterWatches ===

impl ClusterWatches {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl WatchResources for ClusterWatches {
    fn watch(&self, metadata: &KindMetadata, watcher: Arc<ResourceWatcher>) {
        let api =
            kube::Api::<DynamicObject>::all_with(self.client.clone(), metadata.api_resource());
        let events = watcher::watcher(api, watcher::Config::default()).default_backoff();
        let kind = metadata.kind().clone();
        let span = info_span!("watch", %kind);
        tokio::spawn(
            run(kind, Watch::from(events).instrument(span.clone()), watcher).instrument(span),
        );
    }
}

/// Feeds watch events to a watcher until the watch ends.
///
/// Every (re)list is tracked so that resources deleted while the watch was
/// disconnected are reported as deleted once the list completes.
pub(crate) async fn run(
    kind: ResourceKind,
    mut events: Watch<DynamicObject>,
    watcher: Arc<ResourceWatcher>,
) {
    let mut known = HashSet::<NamespacedName>::default();
    let mut relisted: Option<HashSet<NamespacedName>> = None;

    while let Some(event) = events.recv().await {
        match event {
            Event::Init => {
                debug!("Listing resources");
                relisted = Some(Default::default());
            }

            Event::InitApply(obj) => {
                let name = name_of(&obj);
                if let Some(relisted) = relisted.as_mut() {
                    relisted.insert(name.clone());
                }
                known.insert(name.clone());
                apply(&kind, &watcher, name, obj).await;
            }

            Event::InitDone => {
                let Some(relisted) = relisted.take() else {
                    continue;
                };
                let removed = known.difference(&relisted).cloned().collect::<Vec<_>>();
                debug!(resources = relisted.len(), removed = removed.len(), "Listed resources");
                for name in removed {
                    watcher
                        .on_resource_changed(&kind, name, None, &Labels::default())
                        .await;
                }
                known = relisted;
            }

            Event::Apply(obj) => {
                let name = name_of(&obj);
                known.insert(name.clone());
                apply(&kind, &watcher, name, obj).await;
            }

            Event::Delete(obj) => {
                let name = name_of(&obj);
                known.remove(&name);
                let labels = Labels::from(obj.labels().clone());
                watcher
                    .on_resource_changed(&kind, name, None, &labels)
                    .await;
            }
        }
    }

    warn!("Watch ended");
}

async fn apply(
    kind: &ResourceKind,
    watcher: &ResourceWatcher,
    name: NamespacedName,
    obj: DynamicObject,
) {
    let labels = Labels::from(obj.labels().clone());
    watcher
        .on_resource_changed(kind, name, Some(obj), &labels)
        .await;
}

fn name_of(obj: &DynamicObject) -> NamespacedName {
    NamespacedName::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{NamespacedApp, Rule, SubscribeTarget},
        index::{IndexMetrics, PushRules},
    };
    use parking_lot::Mutex;

    const KIND: &str = "fault-tolerance.opensergo.io/v1alpha1/RateLimitStrategy";

    #[derive(Default)]
    struct RecordPush(Mutex<Vec<(SubscribeTarget, usize, i64)>>);

    #[async_trait::async_trait]
    impl PushRules for RecordPush {
        async fn push(
            &self,
            target: SubscribeTarget,
            rules: Vec<Rule>,
            version: i64,
        ) -> anyhow::Result<()> {
            self.0.lock().push((target, rules.len(), version));
            Ok(())
        }
    }

    fn mk_resource(name: &str, app: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "fault-tolerance.opensergo.io/v1alpha1",
            "kind": "RateLimitStrategy",
            "metadata": { "namespace": "default", "name": name, "labels": { "app": app } },
            "spec": {}
        }))
        .expect("resource must deserialize")
    }

    fn mk_watcher(push: Arc<RecordPush>) -> Arc<ResourceWatcher> {
        let translate = Arc::new(|obj: &DynamicObject| -> anyhow::Result<Rule> {
            Ok(Rule {
                type_url: "test/name".to_string(),
                value: obj.name_any().into_bytes(),
            })
        });
        let watcher = Arc::new(ResourceWatcher::new(
            KIND.into(),
            translate,
            push,
            IndexMetrics::default(),
        ));
        watcher
            .add_subscribe_target(&SubscribeTarget::new("default", "foo", KIND))
            .expect("kind must match");
        watcher
    }

    #[tokio::test]
    async fn relist_removes_missing_resources() {
        let _tracing = tracing::subscriber::set_default(
            tracing_subscriber::fmt().with_test_writer().finish(),
        );
        let push = Arc::new(RecordPush::default());
        let watcher = mk_watcher(push.clone());

        let events: Vec<watcher::Result<Event<DynamicObject>>> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(mk_resource("rl-1", "foo"))),
            Ok(Event::InitApply(mk_resource("rl-2", "foo"))),
            Ok(Event::InitDone),
            Ok(Event::Apply(mk_resource("rl-3", "foo"))),
            // The watch is reset and rl-1 has been deleted in the meantime.
            Ok(Event::Init),
            Ok(Event::InitApply(mk_resource("rl-2", "foo"))),
            Ok(Event::InitApply(mk_resource("rl-3", "foo"))),
            Ok(Event::InitDone),
        ];
        run(
            KIND.into(),
            Watch::from(futures::stream::iter(events)),
            watcher.clone(),
        )
        .await;

        let (resources, version) = watcher
            .cache()
            .get_by_app(&NamespacedApp::new("default", "foo"));
        let mut names = resources.iter().map(|r| r.name_any()).collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["rl-2", "rl-3"]);
        assert_eq!(version, 6);

        let pushes = push.0.lock();
        assert_eq!(pushes.last().map(|(_, n, v)| (*n, *v)), Some((2, 6)));
    }

    #[tokio::test]
    async fn deletes_are_forwarded() {
        let push = Arc::new(RecordPush::default());
        let watcher = mk_watcher(push.clone());

        let events: Vec<watcher::Result<Event<DynamicObject>>> = vec![
            Ok(Event::Apply(mk_resource("rl-1", "foo"))),
            Ok(Event::Delete(mk_resource("rl-1", "foo"))),
        ];
        run(
            KIND.into(),
            Watch::from(futures::stream::iter(events)),
            watcher.clone(),
        )
        .await;

        let (resources, version) = watcher
            .cache()
            .get_by_app(&NamespacedApp::new("default", "foo"));
        assert!(resources.is_empty());
        assert_eq!(version, 2);
        assert_eq!(push.0.lock().len(), 2);
    }
}
