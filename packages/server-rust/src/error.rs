//! Error types for connection handling and the processor lifecycle.

use std::io;
use std::time::Duration;

use scgi_core::ProtocolError;
use tokio::task::JoinError;

/// Failure of a single connection.
///
/// Never propagates past the connection task: the task logs it, records a
/// metric, and the socket is closed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("no complete request within {0:?}")]
    Timeout(Duration),
    #[error("request handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error("request handler panicked: {0}")]
    HandlerPanicked(String),
}

impl ConnectionError {
    /// Short label used for log fields and metric tags.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Handler(_) | Self::HandlerPanicked(_) => "handler",
        }
    }
}

/// Fatal processor errors surfaced to the operator.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("start() must be called before serve()")]
    NotStarted,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept failed on the listening socket: {0}")]
    Accept(#[source] io::Error),
    #[error("accept loop task failed: {0}")]
    Task(#[from] JoinError),
}
