//! Per-connection request handling.
//!
//! A connection task owns its socket for its whole life. The socket is
//! closed when the task drops it, which happens exactly once on every path:
//! dispatch, busy redirect, framing error, handler failure or I/O error.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use scgi_core::{Admission, BUSY_RESPONSE};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use super::codec::read_request;
use super::config::ConnectionConfig;
use super::shutdown::ShutdownController;
use crate::error::ConnectionError;
use crate::traits::{RequestHandler, ScgiRequest};

/// Shared state every connection task needs.
pub struct ConnectionContext {
    pub handler: Arc<dyn RequestHandler>,
    pub controller: Arc<ShutdownController>,
    pub config: ConnectionConfig,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("controller", &self.controller)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// How a connection that did not fail was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request reached the application handler.
    Dispatched,
    /// The busy redirect was written instead.
    Redirected,
}

/// Connection task entry point: handles the connection and logs any failure.
///
/// Nothing escapes this function, so a misbehaving connection can never take
/// down the accept loop or the collector.
pub async fn run_connection<S>(stream: S, peer: SocketAddr, context: Arc<ConnectionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match handle_connection(stream, peer, &context).await {
        Ok(Outcome::Dispatched) => {
            metrics::counter!("scgi_requests_dispatched_total").increment(1);
        }
        Ok(Outcome::Redirected) => {
            metrics::counter!("scgi_requests_redirected_total").increment(1);
            debug!("Redirected to /busy.html");
        }
        Err(e) => log_failure(&e),
    }
}

fn log_failure(e: &ConnectionError) {
    match e {
        ConnectionError::Protocol(_) => {
            metrics::counter!("scgi_protocol_errors_total").increment(1);
            warn!(error = %e, "Malformed request, closing connection");
        }
        ConnectionError::Transport(_) | ConnectionError::Timeout(_) => {
            warn!(error = %e, kind = e.kind(), "Connection aborted");
        }
        ConnectionError::Handler(inner) => {
            metrics::counter!("scgi_handler_errors_total").increment(1);
            error!(error = ?inner, "Request handler failed");
        }
        ConnectionError::HandlerPanicked(_) => {
            metrics::counter!("scgi_handler_errors_total").increment(1);
            error!(error = %e, "Request handler panicked");
        }
    }
}

/// Reads one request, applies admission control, and dispatches it.
///
/// Admission is decided after the read attempt but regardless of its
/// result, so a shutting-down or overloaded processor answers every
/// connection with the busy redirect, even one that sent a malformed
/// request.
///
/// # Errors
///
/// Returns the [`ConnectionError`] that ended the connection. The socket has
/// been dropped by the time this returns.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    context: &ConnectionContext,
) -> Result<Outcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = read_with_timeout(&mut stream, peer, context.config.read_timeout).await;

    if context.controller.admission() == Admission::Redirect {
        if let Err(e) = &request {
            debug!(error = %e, "Request was unreadable; redirecting anyway");
        }
        stream.write_all(BUSY_RESPONSE).await?;
        close(stream).await;
        return Ok(Outcome::Redirected);
    }

    let request = request?;
    let result = AssertUnwindSafe(context.handler.handle(request, &mut stream))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(ConnectionError::Handler(e)),
        Err(panic) => return Err(ConnectionError::HandlerPanicked(panic_message(&*panic))),
    }

    stream.flush().await?;
    close(stream).await;
    Ok(Outcome::Dispatched)
}

async fn read_with_timeout<S>(
    stream: &mut S,
    peer: SocketAddr,
    read_timeout: Option<Duration>,
) -> Result<ScgiRequest, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let (headers, body) = match read_timeout {
        Some(limit) => tokio::time::timeout(limit, read_request(stream))
            .await
            .map_err(|_| ConnectionError::Timeout(limit))??,
        None => read_request(stream).await?,
    };
    Ok(ScgiRequest {
        headers,
        body,
        peer,
    })
}

/// Sends FIN, then drops the socket.
async fn close<S: AsyncWrite + Unpin>(mut stream: S) {
    // The peer may already be gone; the drop below closes the socket anyway.
    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Socket shutdown failed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
