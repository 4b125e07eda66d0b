#![warn(rust_2018_idioms)]

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate prometheus;
#[macro_use]
extern crate shadow_clone;

pub mod edge;
pub mod hub;
pub mod int_server;
pub mod registration;
pub mod statistics;

pub use crate::edge::{NodeResolver, SubdomainResolver};
pub use crate::hub::RelayHub;
pub use crate::registration::{AllowAll, NodeAuthenticator, SharedToken};
