//! Translation between local HTTP/WebSocket traffic and tunnel exchanges.
pub mod http;
pub mod ws;
