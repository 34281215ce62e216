use reqwest::StatusCode;
use thiserror::Error;

use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("malformed event payload: {0}")]
    MalformedEvent(String),

    #[error("event stream is offline")]
    Offline,
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}
