use crate::{
    grpc::translate,
    index::{KindMetadata, Kinds},
    k8s::{
        fault_tolerance::{
            CircuitBreakerStrategy, ConcurrencyLimitStrategy, FaultToleranceRule,
            RateLimitStrategy, ThrottlingStrategy,
        },
        networking::VirtualService,
    },
};

/// The resource kinds clients may subscribe to.
pub fn kinds() -> Kinds {
    [
        KindMetadata::of::<RateLimitStrategy>(translate::rate_limit),
        KindMetadata::of::<ThrottlingStrategy>(translate::throttling),
        KindMetadata::of::<ConcurrencyLimitStrategy>(translate::concurrency_limit),
        KindMetadata::of::<CircuitBreakerStrategy>(translate::circuit_breaker),
        KindMetadata::of::<FaultToleranceRule>(translate::fault_tolerance_rule),
        KindMetadata::of::<VirtualService>(translate::virtual_service),
    ]
    .into_iter()
    .collect()
}
