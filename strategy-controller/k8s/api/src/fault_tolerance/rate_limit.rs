#[derive(Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize)]
#[kube(
    group = "fault-tolerance.opensergo.io",
    version = "v1alpha1",
    kind = "RateLimitStrategy",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStrategySpec {
    /// The metric being limited. Only `RequestAmount` is defined.
    pub metric_type: String,
    /// Either `Local` or `Global`.
    pub limit_mode: String,
    pub threshold: i64,
    pub stat_duration_seconds: i32,
}
