#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! gRPC servers for the strategy control plane.
//!
//! Two protocols are served from the same watcher registry:
//!
//! - [`transport`]: a subscribe/push protocol in which clients name the
//!   `(namespace, app, kinds)` they are interested in and receive every
//!   version of the rules for each.
//! - [`discovery`]: an xDS-style discovery protocol in which clients request
//!   resource names and acknowledge responses by nonce.

pub mod delta;
pub mod discovery;
pub mod dispatch;
pub mod metrics;
mod nonce;
mod push;
mod subscribers;
pub mod translate;
pub mod transport;


pub use self::{
    dispatch::{Dispatcher, Publish, Workers},
    push::{PushConfig, PushError},
    subscribers::Subscribers,
};

#[allow(warnings, clippy::all, rust_2018_idioms)]
pub mod api {
    include!(concat!(env!("OUT_DIR"), "/mod.rs"));

    pub use self::{
        envoy::config::route::v3 as route,
        io::opensergo::proto::{
            fault_tolerance::v1 as fault_tolerance, router::v1 as router,
            transport::v1 as transport,
        },
    };
}
