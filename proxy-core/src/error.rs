use std::io;
use thiserror::Error;

/// Errors surfaced by the scheduling engine. Every variant that reaches a client maps onto
/// an `-ERR <text>\r\n` reply; see the dispatch table in the scheduler module.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request")]
    ProtocolError,

    #[error("Unsupported command: '{0}'")]
    UnsupportedCommand(String),

    #[error("Queries with keys belonging to different nodes are not supported")]
    CrossSlot,

    #[error("Could not connect to node")]
    ConnectFailed,

    #[error("Cluster node disconnected")]
    ClusterNodeDisconnected,

    #[error("Failed to read reply")]
    ReplyDecodeFailed,

    #[error("client disconnected")]
    ClientGone,

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Would-block is not a real error, just "try again later"; callers that read this
    /// from an `io::Error` should branch on it before converting to `ProxyError`.
    pub fn is_would_block(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::WouldBlock
    }

    /// Render the text that goes out on the wire after `-ERR `. Only variants that the
    /// scheduler actually sends to a client need a stable rendering here.
    pub fn wire_text(&self) -> String {
        match self {
            ProxyError::ProtocolError => "Invalid request".into(),
            ProxyError::UnsupportedCommand(name) => format!("Unsupported command: '{name}'"),
            ProxyError::CrossSlot => {
                "Queries with keys belonging to different nodes are not supported".into()
            }
            ProxyError::ConnectFailed => "Could not connect to node".into(),
            ProxyError::ClusterNodeDisconnected => "Cluster node disconnected".into(),
            ProxyError::ReplyDecodeFailed => "Failed to read reply".into(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
