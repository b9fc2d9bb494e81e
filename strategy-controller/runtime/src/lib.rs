#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use strategy_controller_core as core;
pub use strategy_controller_grpc as grpc;
pub use strategy_controller_k8s_api as k8s;
pub use strategy_controller_k8s_index as index;

mod args;
mod kinds;
mod watches;

pub use self::{args::Args, kinds::kinds, watches::ClusterWatches};
