//! Accept loop: owns the listening socket and spawns a task per connection.

use std::io;
use std::sync::{Arc, Weak};

use scgi_core::LifecycleState;
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::connection::{ConnectionRegistry, TaskSubmitter};
use super::handler::{run_connection, ConnectionContext};
use crate::error::ServerError;

/// Accepts connections until the shutdown controller closes the listener.
///
/// The loop never decides when to shut down; it only observes the state
/// held by the [`ShutdownController`](super::ShutdownController), which also
/// owns the socket. The loop holds a strong reference only while an
/// `accept` is pending.
#[derive(Debug)]
pub struct AcceptLoop {
    listener: Weak<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    submitter: TaskSubmitter,
    context: Arc<ConnectionContext>,
}

impl AcceptLoop {
    #[must_use]
    pub fn new(
        listener: Weak<TcpListener>,
        registry: Arc<ConnectionRegistry>,
        submitter: TaskSubmitter,
        context: Arc<ConnectionContext>,
    ) -> Self {
        Self {
            listener,
            registry,
            submitter,
            context,
        }
    }

    /// Runs the loop, then closes the socket and marks the processor `Dead`.
    ///
    /// Returns the lifecycle state observed just before `Dead`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Accept`] when `accept` fails outside of a
    /// requested shutdown. The processor is still marked `Dead`.
    pub async fn run(self) -> Result<LifecycleState, ServerError> {
        let Self {
            listener,
            registry,
            submitter,
            context,
        } = self;
        let controller = Arc::clone(&context.controller);

        let result = loop {
            let accepted = {
                let Some(socket) = listener.upgrade() else {
                    break Ok(());
                };
                tokio::select! {
                    biased;
                    () = controller.listener_closed() => break Ok(()),
                    accepted = socket.accept() => accepted,
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    let id = registry.register(peer);
                    let active = controller.connection_opened();
                    metrics::counter!("scgi_connections_accepted_total").increment(1);
                    debug!(connection = %id, %peer, active, "Accepted connection");

                    let span = info_span!("connection", id = id.0, %peer);
                    let task = tokio::spawn(
                        run_connection(stream, peer, Arc::clone(&context)).instrument(span),
                    );
                    if let Err(orphan) = submitter.submit(id, task) {
                        error!(connection = %orphan.id, "Collector is gone; connection will not be reclaimed");
                    }
                }
                Err(e) if is_per_connection(&e) => {
                    warn!(error = %e, "Connection failed during accept");
                }
                Err(e) => {
                    if controller.is_listener_closed() {
                        break Ok(());
                    }
                    error!(error = %e, "Accept failed on the listening socket");
                    break Err(ServerError::Accept(e));
                }
            }

            if controller.drain_complete() {
                break Ok(());
            }
        };

        drop(submitter);
        let previous = controller.mark_dead();
        info!("Exited accept loop. Shutdown complete.");
        result.map(|()| previous)
    }
}

/// Errors that concern one pending connection, not the listening socket.
fn is_per_connection(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_connection_accept_errors_are_not_fatal() {
        assert!(is_per_connection(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_per_connection(&io::ErrorKind::ConnectionReset.into()));
        assert!(!is_per_connection(&io::ErrorKind::PermissionDenied.into()));
        assert!(!is_per_connection(&io::Error::other("too many open files")));
    }
}
