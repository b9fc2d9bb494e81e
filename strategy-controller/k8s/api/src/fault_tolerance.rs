//! Fault-tolerance strategy resources in the `fault-tolerance.opensergo.io`
//! API group.

mod circuit_breaker;
mod concurrency_limit;
mod rate_limit;
mod rule;
mod throttling;

pub use self::{
    circuit_breaker::{
        CircuitBreakerStrategy, CircuitBreakerStrategySpec, ErrorConditions, SlowConditions,
    },
    concurrency_limit::{ConcurrencyLimitStrategy, ConcurrencyLimitStrategySpec},
    rate_limit::{RateLimitStrategy, RateLimitStrategySpec},
    rule::{FaultToleranceRule, FaultToleranceRuleSpec, StrategyRef, TargetRef},
    throttling::{ThrottlingStrategy, ThrottlingStrategySpec},
};

pub const GROUP: &str = "fault-tolerance.opensergo.io";
pub const VERSION: &str = "v1alpha1";
