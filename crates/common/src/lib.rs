#![warn(rust_2018_idioms)]

#[macro_use]
extern crate tracing;

pub mod bridge;
pub mod clap;
pub mod codec;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod head;
pub mod settings;
pub mod transport;

pub use crate::codec::{Frame, PacketType, RequestId, WireFrame};
pub use crate::connection::{Exchange, IncomingExchange, NodeConnection, Role};
pub use crate::correlation::{CorrelationTable, PendingExchange};
pub use crate::error::Error;
pub use crate::settings::TunnelSettings;
pub use crate::transport::Transport;
