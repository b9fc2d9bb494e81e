#[derive(Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize)]
#[kube(
    group = "fault-tolerance.opensergo.io",
    version = "v1alpha1",
    kind = "CircuitBreakerStrategy",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStrategySpec {
    /// Either `SlowRequestRatio` or `ErrorRequestRatio`.
    pub strategy: String,
    /// A percentage, e.g. `60%`.
    pub trigger_ratio: String,
    pub stat_duration: String,
    pub recovery_timeout: String,
    pub min_request_amount: i32,
    #[serde(default)]
    pub slow_conditions: SlowConditions,
    #[serde(default)]
    pub error_conditions: ErrorConditions,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowConditions {
    /// Requests slower than this are counted as slow.
    #[serde(default)]
    pub max_allowed_rt: String,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct ErrorConditions {}
