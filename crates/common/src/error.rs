use crate::codec::CodecError;
use hyper::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node `{0}` is not connected")]
    NodeNotConnected(String),

    #[error("timeout")]
    Timeout,

    #[error("node disconnected")]
    NodeDisconnected,

    #[error("malformed exchange: {0}")]
    Malformed(String),

    #[error("exchange aborted")]
    Aborted,

    #[error("codec error: `{0}`")]
    Codec(#[from] CodecError),

    #[error("websocket error: `{0}`")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("transport error: `{0}`")]
    Transport(String),

    #[error("HTTP error: `{0}`")]
    Hyper(#[from] hyper::Error),

    #[error("bad HTTP head: `{0}`")]
    Http(#[from] http::Error),

    #[error("io error: `{0}`")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Status code reported to the edge caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Physical connection failures. Only these tear down a whole node connection.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Error::Codec(_) | Error::WebSocket(_) | Error::Transport(_) | Error::Io(_)
        )
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::NodeNotConnected("a".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(Error::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            Error::NodeDisconnected.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
