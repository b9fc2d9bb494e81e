#[derive(Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize)]
#[kube(
    group = "fault-tolerance.opensergo.io",
    version = "v1alpha1",
    kind = "FaultToleranceRule",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct FaultToleranceRuleSpec {
    #[serde(default)]
    pub targets: Vec<TargetRef>,
    #[serde(default)]
    pub strategies: Vec<StrategyRef>,
}

/// Names a resource (e.g. an HTTP path or RPC method) that strategies apply to.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub target_resource_name: String,
}

/// References a strategy resource by name and kind.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRef {
    pub name: String,
    pub kind: String,
}
