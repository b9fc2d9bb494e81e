//! Translates strategy resources into their protobuf wire messages.
//!
//! Each message is packed into a `google.protobuf.Any`. Duration strings are
//! sent as milliseconds and ratio strings as fractions; values that cannot be
//! parsed are sent as `-1`.
//!
//! Virtual services become route configurations whose clusters are named
//! `outbound||<subset>|<host>.<namespace>.svc.cluster.local`.

use crate::api::{
    envoy::{config::core::v3::TypedExtensionConfig, r#type::matcher::v3 as matcher},
    fault_tolerance as proto,
    route, router,
};
use prost::Message;
use strategy_controller_core::Rule;
use strategy_controller_k8s_api::{
    duration,
    fault_tolerance::{
        CircuitBreakerStrategy, ConcurrencyLimitStrategy, FaultToleranceRule, RateLimitStrategy,
        ThrottlingStrategy,
    },
    networking::{HttpMatchRequest, HttpRoute, StringMatch, VirtualService},
    ResourceExt,
};
use tracing::debug;

const TYPE_URL_PREFIX: &str = "type.googleapis.com/io.opensergo.proto.fault_tolerance.v1.";

pub const ROUTE_CONFIGURATION_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

const CLUSTER_FALLBACK_TYPE_URL: &str =
    "type.googleapis.com/io.opensergo.proto.router.v1.ClusterFallbackConfig";

/// The name of the cluster specifier plugin that implements fallbacks.
pub const CLUSTER_FALLBACK_PLUGIN: &str = "envoy.router.cluster_specifier_plugin.cluster_fallback";

pub fn rate_limit(rls: &RateLimitStrategy) -> anyhow::Result<Rule> {
    use proto::rate_limit_strategy::{LimitMode, MetricType};

    let metric_type = match rls.spec.metric_type.as_str() {
        "RequestAmount" => MetricType::TypeRequestAmount,
        _ => MetricType::TypeUnknown,
    };
    let limit_mode = match rls.spec.limit_mode.as_str() {
        "Local" => LimitMode::ModeLocal,
        "Global" => LimitMode::ModeGlobal,
        _ => LimitMode::ModeUnknown,
    };

    Ok(pack(
        "RateLimitStrategy",
        &proto::RateLimitStrategy {
            name: rls.name_any(),
            metric_type: metric_type as i32,
            limit_mode: limit_mode as i32,
            threshold: rls.spec.threshold,
            stat_duration: rls.spec.stat_duration_seconds,
            stat_duration_time_unit: proto::TimeUnit::Seconds as i32,
        },
    ))
}

pub fn throttling(ts: &ThrottlingStrategy) -> anyhow::Result<Rule> {
    Ok(pack(
        "ThrottlingStrategy",
        &proto::ThrottlingStrategy {
            name: ts.name_any(),
            min_interval_millis_of_requests: millis(&ts.spec.min_interval_of_requests),
            queue_timeout_millis: millis(&ts.spec.queue_timeout),
        },
    ))
}

pub fn concurrency_limit(cls: &ConcurrencyLimitStrategy) -> anyhow::Result<Rule> {
    use proto::concurrency_limit_strategy::LimitMode;

    let limit_mode = match cls.spec.limit_mode.as_str() {
        "Local" => LimitMode::ModeLocal,
        "Global" => LimitMode::ModeGlobal,
        _ => LimitMode::ModeUnknown,
    };

    Ok(pack(
        "ConcurrencyLimitStrategy",
        &proto::ConcurrencyLimitStrategy {
            name: cls.name_any(),
            limit_mode: limit_mode as i32,
            max_concurrency: cls.spec.max_concurrency_threshold,
        },
    ))
}

pub fn circuit_breaker(cbs: &CircuitBreakerStrategy) -> anyhow::Result<Rule> {
    use proto::circuit_breaker_strategy::{
        CircuitBreakerErrorCondition, CircuitBreakerSlowCondition, Strategy,
    };

    let strategy = match cbs.spec.strategy.as_str() {
        "SlowRequestRatio" => Strategy::SlowRequestRatio,
        "ErrorRequestRatio" => Strategy::ErrorRequestRatio,
        _ => Strategy::Unknown,
    };
    let trigger_ratio = duration::parse_ratio(&cbs.spec.trigger_ratio).unwrap_or_else(|error| {
        debug!(%error, value = %cbs.spec.trigger_ratio, "Invalid ratio");
        -1.0
    });

    Ok(pack(
        "CircuitBreakerStrategy",
        &proto::CircuitBreakerStrategy {
            name: cbs.name_any(),
            strategy: strategy as i32,
            trigger_ratio,
            stat_duration: millis(&cbs.spec.stat_duration),
            stat_duration_time_unit: proto::TimeUnit::Milliseconds as i32,
            recovery_timeout: millis_i32(&cbs.spec.recovery_timeout),
            recovery_timeout_time_unit: proto::TimeUnit::Milliseconds as i32,
            min_request_amount: cbs.spec.min_request_amount,
            slow_condition: Some(CircuitBreakerSlowCondition {
                max_allowed_rt_millis: millis_i32(&cbs.spec.slow_conditions.max_allowed_rt),
            }),
            error_condition: Some(CircuitBreakerErrorCondition {}),
        },
    ))
}

pub fn fault_tolerance_rule(ftr: &FaultToleranceRule) -> anyhow::Result<Rule> {
    use proto::fault_tolerance_rule::{FaultToleranceRuleTargetRef, FaultToleranceStrategyRef};

    Ok(pack(
        "FaultToleranceRule",
        &proto::FaultToleranceRule {
            targets: ftr
                .spec
                .targets
                .iter()
                .map(|t| FaultToleranceRuleTargetRef {
                    target_resource_name: t.target_resource_name.clone(),
                })
                .collect(),
            strategies: ftr
                .spec
                .strategies
                .iter()
                .map(|s| FaultToleranceStrategyRef {
                    name: s.name.clone(),
                    kind: s.kind.clone(),
                })
                .collect(),
            action: None,
        },
    ))
}

pub fn virtual_service(vs: &VirtualService) -> anyhow::Result<Rule> {
    let name = vs.name_any();
    let namespace = vs.namespace().unwrap_or_default();
    let virtual_host = route::VirtualHost {
        name: name.clone(),
        domains: vs
            .spec
            .hosts
            .iter()
            .map(|host| fqdn(host, &namespace))
            .collect(),
        routes: vs
            .spec
            .http
            .iter()
            .map(|http| http_route(http, &namespace))
            .collect(),
    };

    Ok(Rule {
        type_url: ROUTE_CONFIGURATION_TYPE_URL.to_string(),
        value: route::RouteConfiguration {
            name,
            virtual_hosts: vec![virtual_host],
        }
        .encode_to_vec(),
    })
}

fn http_route(http: &HttpRoute, namespace: &str) -> route::Route {
    route::Route {
        r#match: Some(route::RouteMatch {
            headers: header_matchers(&http.matches),
            query_parameters: query_parameter_matchers(&http.matches),
        }),
        action: Some(route::route::Action::Route(route_action(http, namespace))),
    }
}

fn route_action(http: &HttpRoute, namespace: &str) -> route::RouteAction {
    use route::route_action::ClusterSpecifier;

    let specifier = match http.route.as_slice() {
        [single] => {
            let dst = &single.destination;
            let routing = cluster(&dst.host, namespace, &dst.subset);
            match dst.fallback.as_ref() {
                Some(fallback) => {
                    let fallback = cluster(&fallback.host, namespace, &fallback.subset);
                    ClusterSpecifier::InlineClusterSpecifierPlugin(fallback_plugin(
                        routing, fallback,
                    ))
                }
                None => ClusterSpecifier::Cluster(routing),
            }
        }
        destinations => ClusterSpecifier::WeightedClusters(route::WeightedCluster {
            clusters: destinations
                .iter()
                .map(|d| route::weighted_cluster::ClusterWeight {
                    name: cluster(&d.destination.host, namespace, &d.destination.subset),
                    weight: Some(u32::try_from(d.weight).unwrap_or(0)),
                })
                .collect(),
        }),
    };

    route::RouteAction {
        cluster_specifier: Some(specifier),
    }
}

fn fallback_plugin(routing: String, fallback: String) -> route::ClusterSpecifierPlugin {
    let config = router::ClusterFallbackConfig {
        config: Some(router::cluster_fallback_config::ClusterConfig {
            routing_cluster: routing,
            fallback_cluster: fallback,
        }),
    };
    route::ClusterSpecifierPlugin {
        extension: Some(TypedExtensionConfig {
            name: CLUSTER_FALLBACK_PLUGIN.to_string(),
            typed_config: Some(Rule {
                type_url: CLUSTER_FALLBACK_TYPE_URL.to_string(),
                value: config.encode_to_vec(),
            }),
        }),
    }
}

/// Header matchers of every match request, in header-name order.
fn header_matchers(matches: &[HttpMatchRequest]) -> Vec<route::HeaderMatcher> {
    use route::header_matcher::HeaderMatchSpecifier;

    matches
        .iter()
        .flat_map(|m| m.headers.iter())
        .map(|(name, sm)| route::HeaderMatcher {
            name: name.clone(),
            header_match_specifier: match pattern(sm) {
                Some(Pattern::Exact(v)) => Some(HeaderMatchSpecifier::ExactMatch(v)),
                Some(Pattern::Prefix(v)) => Some(HeaderMatchSpecifier::PrefixMatch(v)),
                Some(Pattern::Regex(regex)) => Some(HeaderMatchSpecifier::SafeRegexMatch(
                    matcher::RegexMatcher { regex },
                )),
                None => None,
            },
        })
        .collect()
}

fn query_parameter_matchers(matches: &[HttpMatchRequest]) -> Vec<route::QueryParameterMatcher> {
    use matcher::string_matcher::MatchPattern;
    use route::query_parameter_matcher::QueryParameterMatchSpecifier;

    matches
        .iter()
        .flat_map(|m| m.query_params.iter())
        .map(|(name, sm)| {
            let pattern = pattern(sm).map(|p| match p {
                Pattern::Exact(v) => MatchPattern::Exact(v),
                Pattern::Prefix(v) => MatchPattern::Prefix(v),
                Pattern::Regex(regex) => MatchPattern::SafeRegex(matcher::RegexMatcher { regex }),
            });
            route::QueryParameterMatcher {
                name: name.clone(),
                query_parameter_match_specifier: pattern.map(|p| {
                    QueryParameterMatchSpecifier::StringMatch(matcher::StringMatcher {
                        match_pattern: Some(p),
                    })
                }),
            }
        })
        .collect()
}

enum Pattern {
    Exact(String),
    Prefix(String),
    Regex(String),
}

/// Picks the match pattern, preferring `exact`, then `prefix`, then `regex`.
/// Empty values are unset.
fn pattern(sm: &StringMatch) -> Option<Pattern> {
    let set = |v: &Option<String>| v.clone().filter(|v| !v.is_empty());
    set(&sm.exact)
        .map(Pattern::Exact)
        .or_else(|| set(&sm.prefix).map(Pattern::Prefix))
        .or_else(|| set(&sm.regex).map(Pattern::Regex))
}

fn cluster(host: &str, namespace: &str, subset: &str) -> String {
    format!("outbound||{subset}|{}", fqdn(host, namespace))
}

fn fqdn(host: &str, namespace: &str) -> String {
    format!("{host}.{namespace}.svc.cluster.local")
}

fn pack(message: &str, msg: &impl Message) -> Rule {
    Rule {
        type_url: format!("{TYPE_URL_PREFIX}{message}"),
        value: msg.encode_to_vec(),
    }
}

fn millis(value: &str) -> i64 {
    duration::parse_millis(value).unwrap_or_else(|error| {
        debug!(%error, %value, "Invalid duration");
        -1
    })
}

fn millis_i32(value: &str) -> i32 {
    i32::try_from(millis(value)).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strategy_controller_k8s_api::fault_tolerance::{
        CircuitBreakerStrategySpec, RateLimitStrategySpec, SlowConditions, ThrottlingStrategySpec,
    };

    fn decode<M: Message + Default>(rule: &Rule) -> M {
        M::decode(rule.value.as_slice()).expect("rule must decode")
    }

    #[test]
    fn rate_limit_modes() {
        let rls = RateLimitStrategy::new(
            "rl-1",
            RateLimitStrategySpec {
                metric_type: "RequestAmount".to_string(),
                limit_mode: "Global".to_string(),
                threshold: 10,
                stat_duration_seconds: 1,
            },
        );
        let rule = rate_limit(&rls).expect("must translate");
        assert_eq!(
            rule.type_url,
            "type.googleapis.com/io.opensergo.proto.fault_tolerance.v1.RateLimitStrategy"
        );

        let msg = decode::<proto::RateLimitStrategy>(&rule);
        assert_eq!(msg.name, "rl-1");
        assert_eq!(
            msg.metric_type(),
            proto::rate_limit_strategy::MetricType::TypeRequestAmount
        );
        assert_eq!(
            msg.limit_mode(),
            proto::rate_limit_strategy::LimitMode::ModeGlobal
        );
        assert_eq!(msg.threshold, 10);
        assert_eq!(msg.stat_duration_time_unit(), proto::TimeUnit::Seconds);
    }

    #[test]
    fn throttling_durations() {
        let ts = ThrottlingStrategy::new(
            "ts-1",
            ThrottlingStrategySpec {
                min_interval_of_requests: "20ms".to_string(),
                queue_timeout: "soon".to_string(),
            },
        );
        let msg = decode::<proto::ThrottlingStrategy>(&throttling(&ts).expect("must translate"));
        assert_eq!(msg.min_interval_millis_of_requests, 20);
        assert_eq!(msg.queue_timeout_millis, -1);
    }

    #[test]
    fn circuit_breaker_ratios_and_durations() {
        let cbs = CircuitBreakerStrategy::new(
            "cb-1",
            CircuitBreakerStrategySpec {
                strategy: "SlowRequestRatio".to_string(),
                trigger_ratio: "60%".to_string(),
                stat_duration: "30s".to_string(),
                recovery_timeout: "5s".to_string(),
                min_request_amount: 5,
                slow_conditions: SlowConditions {
                    max_allowed_rt: "500ms".to_string(),
                },
                error_conditions: Default::default(),
            },
        );
        let rule = circuit_breaker(&cbs).expect("must translate");
        let msg = decode::<proto::CircuitBreakerStrategy>(&rule);
        assert_eq!(
            msg.strategy(),
            proto::circuit_breaker_strategy::Strategy::SlowRequestRatio
        );
        assert!((msg.trigger_ratio - 0.6).abs() < f64::EPSILON);
        assert_eq!(msg.stat_duration, 30_000);
        assert_eq!(msg.recovery_timeout, 5_000);
        assert_eq!(msg.min_request_amount, 5);
        assert_eq!(
            msg.slow_condition.map(|c| c.max_allowed_rt_millis),
            Some(500)
        );
    }

    #[test]
    fn unparseable_ratio() {
        let cbs = CircuitBreakerStrategy::new(
            "cb-2",
            CircuitBreakerStrategySpec {
                strategy: "ErrorRequestRatio".to_string(),
                trigger_ratio: "most".to_string(),
                stat_duration: "1s".to_string(),
                recovery_timeout: "1s".to_string(),
                min_request_amount: 1,
                slow_conditions: Default::default(),
                error_conditions: Default::default(),
            },
        );
        let rule = circuit_breaker(&cbs).expect("must translate");
        let msg = decode::<proto::CircuitBreakerStrategy>(&rule);
        assert_eq!(msg.trigger_ratio, -1.0);
        assert_eq!(msg.slow_condition.map(|c| c.max_allowed_rt_millis), Some(-1));
    }

    fn mk_virtual_service(http: serde_json::Value) -> VirtualService {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "networking.istio.io/v1beta1",
            "kind": "VirtualService",
            "metadata": { "name": "reviews", "namespace": "shop", "labels": { "app": "foo" } },
            "spec": { "hosts": ["reviews", "ratings"], "http": http }
        }))
        .expect("resource must deserialize")
    }

    fn action(rule: &Rule, idx: usize) -> route::route_action::ClusterSpecifier {
        let config = decode::<route::RouteConfiguration>(rule);
        let r = config.virtual_hosts[0].routes[idx].clone();
        match r.action {
            Some(route::route::Action::Route(action)) => {
                action.cluster_specifier.expect("must specify a cluster")
            }
            None => panic!("route must have an action"),
        }
    }

    #[test]
    fn virtual_service_single_destination() {
        let vs = mk_virtual_service(serde_json::json!([{
            "match": [{
                "headers": {
                    "x-user": { "prefix": "gray-" },
                    "x-tag": { "exact": "canary", "regex": "ignored" }
                },
                "queryParams": { "v": { "regex": "^2" } }
            }],
            "route": [{ "destination": { "host": "reviews", "subset": "v2" } }]
        }]));
        let rule = virtual_service(&vs).expect("must translate");
        assert_eq!(rule.type_url, ROUTE_CONFIGURATION_TYPE_URL);

        let config = decode::<route::RouteConfiguration>(&rule);
        assert_eq!(config.name, "reviews");
        let host = &config.virtual_hosts[0];
        assert_eq!(host.name, "reviews");
        assert_eq!(
            host.domains,
            vec![
                "reviews.shop.svc.cluster.local",
                "ratings.shop.svc.cluster.local"
            ]
        );

        let matches = host.routes[0].r#match.clone().expect("must match");
        use route::header_matcher::HeaderMatchSpecifier;
        assert_eq!(
            matches
                .headers
                .iter()
                .map(|h| (h.name.as_str(), h.header_match_specifier.clone()))
                .collect::<Vec<_>>(),
            vec![
                (
                    "x-tag",
                    Some(HeaderMatchSpecifier::ExactMatch("canary".to_string()))
                ),
                (
                    "x-user",
                    Some(HeaderMatchSpecifier::PrefixMatch("gray-".to_string()))
                ),
            ]
        );
        assert_eq!(matches.query_parameters.len(), 1);
        assert_eq!(matches.query_parameters[0].name, "v");
        assert_eq!(
            matches.query_parameters[0].query_parameter_match_specifier,
            Some(
                route::query_parameter_matcher::QueryParameterMatchSpecifier::StringMatch(
                    matcher::StringMatcher {
                        match_pattern: Some(matcher::string_matcher::MatchPattern::SafeRegex(
                            matcher::RegexMatcher {
                                regex: "^2".to_string()
                            }
                        )),
                    }
                )
            )
        );

        assert_eq!(
            action(&rule, 0),
            route::route_action::ClusterSpecifier::Cluster(
                "outbound||v2|reviews.shop.svc.cluster.local".to_string()
            )
        );
    }

    #[test]
    fn virtual_service_weighted_destinations() {
        let vs = mk_virtual_service(serde_json::json!([{
            "route": [
                { "destination": { "host": "reviews", "subset": "v1" }, "weight": 80 },
                { "destination": { "host": "reviews", "subset": "v2" }, "weight": 20 }
            ]
        }]));
        let rule = virtual_service(&vs).expect("must translate");
        let route::route_action::ClusterSpecifier::WeightedClusters(weighted) = action(&rule, 0)
        else {
            panic!("destinations must be weighted");
        };
        assert_eq!(
            weighted
                .clusters
                .iter()
                .map(|c| (c.name.as_str(), c.weight))
                .collect::<Vec<_>>(),
            vec![
                ("outbound||v1|reviews.shop.svc.cluster.local", Some(80)),
                ("outbound||v2|reviews.shop.svc.cluster.local", Some(20)),
            ]
        );
    }

    #[test]
    fn virtual_service_fallback_destination() {
        let vs = mk_virtual_service(serde_json::json!([{
            "route": [{
                "destination": {
                    "host": "reviews",
                    "subset": "v2",
                    "fallback": { "host": "reviews", "subset": "v1" }
                }
            }]
        }]));
        let rule = virtual_service(&vs).expect("must translate");
        let route::route_action::ClusterSpecifier::InlineClusterSpecifierPlugin(plugin) =
            action(&rule, 0)
        else {
            panic!("fallbacks must use the cluster specifier plugin");
        };
        let extension = plugin.extension.expect("must carry an extension");
        assert_eq!(extension.name, CLUSTER_FALLBACK_PLUGIN);
        let config = decode::<router::ClusterFallbackConfig>(
            &extension.typed_config.expect("must carry a config"),
        )
        .config
        .expect("must carry clusters");
        assert_eq!(
            config.routing_cluster,
            "outbound||v2|reviews.shop.svc.cluster.local"
        );
        assert_eq!(
            config.fallback_cluster,
            "outbound||v1|reviews.shop.svc.cluster.local"
        );
    }
}
