#[derive(Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize)]
#[kube(
    group = "fault-tolerance.opensergo.io",
    version = "v1alpha1",
    kind = "ThrottlingStrategy",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ThrottlingStrategySpec {
    /// A duration string, e.g. `20ms`.
    pub min_interval_of_requests: String,
    /// A duration string, e.g. `500ms`.
    pub queue_timeout: String,
}
