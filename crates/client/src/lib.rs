#![warn(rust_2018_idioms)]

#[macro_use]
extern crate tracing;

pub mod backoff;
pub mod client;
pub mod config;

pub use crate::client::TunnelClient;
pub use crate::config::ClientConfig;
