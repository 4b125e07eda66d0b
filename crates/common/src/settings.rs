use crate::codec::DEFAULT_FRAGMENT_SIZE;
use std::time::Duration;

pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 128;
pub const DEFAULT_EXCHANGE_QUEUE_DEPTH: usize = 64;

/// Limits shared by both tunnel peers.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Bound on every single frame wait: enqueueing, physical write, next frame of a
    /// streaming exchange.
    pub frame_timeout: Duration,

    /// Bound on an exchange up to its response head, and on WebSocket handshakes.
    pub exchange_timeout: Duration,

    pub fragment_size: usize,
    pub write_queue_depth: usize,
    pub exchange_queue_depth: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        TunnelSettings {
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            exchange_queue_depth: DEFAULT_EXCHANGE_QUEUE_DEPTH,
        }
    }
}
