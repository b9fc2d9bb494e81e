//! Strategy resource index
//!
//! Resources are indexed per kind. A kind becomes active when a client first
//! subscribes to it: the [`WatcherRegistry`] creates a [`ResourceWatcher`] for
//! the kind and starts delivering cluster change events to it.
//!
//! Each watcher caches the resources bound to subscribed applications (via
//! the `app` label), grouped by `(namespace, app)`. Every change to a group
//! increments its version and pushes the group's translated rules to the
//! application's subscribers.
//!
//! ```text
//! [ cluster watch ] -> [ ResourceWatcher ] -> [ ResourceCache ]
//!                             |
//!                             v
//!                       [ PushRules ] -> subscribers of (namespace, app, kind)
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod kinds;
mod metrics;
mod registry;
mod watcher;


pub use self::{
    cache::{ResourceCache, SetOp},
    kinds::{KindMetadata, Kinds, Translate},
    metrics::IndexMetrics,
    registry::{WatchError, WatchResources, WatcherRegistry},
    watcher::{PushRules, ResourceWatcher},
};
