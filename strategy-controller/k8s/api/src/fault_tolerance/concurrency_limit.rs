#[derive(Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize)]
#[kube(
    group = "fault-tolerance.opensergo.io",
    version = "v1alpha1",
    kind = "ConcurrencyLimitStrategy",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyLimitStrategySpec {
    #[serde(rename = "maxConcurrency")]
    pub max_concurrency_threshold: i64,
    /// Either `Local` or `Global`.
    pub limit_mode: String,
}
