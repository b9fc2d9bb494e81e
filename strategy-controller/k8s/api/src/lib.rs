#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod fault_tolerance;
pub mod labels;
pub mod networking;
mod watch;

pub use self::{
    labels::{Labels, APP_LABEL},
    watch::{Event, Watch},
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::{
    api::{ApiResource, DynamicObject, ResourceExt},
    Resource,
};

/// Formats the resource kind clients use to subscribe to `K`, i.e.
/// `<group>/<version>/<Kind>`.
pub fn resource_kind<K>() -> String
where
    K: Resource<DynamicType = ()>,
{
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}
