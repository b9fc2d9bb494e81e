#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod connection;
mod fanout;
mod resource_name;
mod target;

pub use self::{
    connection::{Connection, ConnectionRegistry, RegistryError},
    fanout::FanoutMode,
    resource_name::{InvalidResourceName, ResourceName},
    target::{ClientIdentifier, NamespacedApp, NamespacedName, ResourceKind, SubscribeTarget},
};

/// A translated, wire-ready rule.
pub type Rule = prost_types::Any;

