//! SCGI processor with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates shared state,
//! `start()` binds the TCP listener, and `serve()` runs the accept loop and
//! the collector until shutdown. The shutdown controller can be handed to
//! signal handling between `new()` and `serve()`.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use scgi_core::LifecycleState;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::config::ProcessorConfig;
use super::connection::{collector_channel, ConnectionRegistry};
use super::handler::ConnectionContext;
use super::listener::AcceptLoop;
use super::shutdown::ShutdownController;
use crate::error::ServerError;
use crate::traits::RequestHandler;

/// Composition root of the gateway.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- allocates the registry and shutdown controller
/// 2. `start()` -- binds and hands the listening socket to the shutdown
///    controller, which can close it from then on
/// 3. `serve()` -- accepts connections until the listener is closed
pub struct Processor {
    config: ProcessorConfig,
    handler: Arc<dyn RequestHandler>,
    listener: Option<Weak<TcpListener>>,
    registry: Arc<ConnectionRegistry>,
    controller: Arc<ShutdownController>,
}

impl Processor {
    /// Creates a processor without binding any port.
    #[must_use]
    pub fn new(config: ProcessorConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let controller = Arc::new(ShutdownController::new(config.max_connections));
        Self {
            config,
            handler,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            controller,
        }
    }

    /// Returns a shared reference to the connection registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Returns a shared reference to the shutdown controller.
    ///
    /// Signal handling and tests use this to trigger shutdown or read status.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.controller)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the bound address, whose port differs from the configured one
    /// when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let addr = self.config.bind_addr();
        let bind_err = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;

        info!(
            "SCGI processor listening on {} (max connections {}, environment {})",
            local, self.config.max_connections, self.config.environment
        );

        self.listener = Some(self.controller.adopt_listener(listener));
        Ok(local)
    }

    /// Runs the processor until the listener is closed by a shutdown.
    ///
    /// After a graceful shutdown every connection has been reclaimed when
    /// this returns. After a forced shutdown it returns as soon as the accept
    /// loop exits; connections still in flight finish in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotStarted`] without a listener, and
    /// [`ServerError::Accept`] or [`ServerError::Task`] if the accept loop
    /// fails.
    pub async fn serve(self) -> Result<(), ServerError> {
        let listener = self.listener.ok_or(ServerError::NotStarted)?;
        let registry = self.registry;
        let controller = self.controller;

        let (submitter, collector) = collector_channel(Arc::clone(&registry), Arc::clone(&controller));
        let collector = tokio::spawn(collector.run());

        let context = Arc::new(ConnectionContext {
            handler: self.handler,
            controller: Arc::clone(&controller),
            config: self.config.connection,
        });
        let accept_loop = AcceptLoop::new(listener, registry, submitter, context);
        let exit_state = tokio::spawn(accept_loop.run()).await??;

        if exit_state == LifecycleState::Forced {
            let abandoned = controller.active_count();
            if abandoned > 0 {
                warn!("Forced shutdown left {} connections in flight", abandoned);
            }
            return Ok(());
        }

        match collector.await {
            Ok(reclaimed) => debug!(reclaimed, "Collector finished"),
            Err(e) => warn!(error = %e, "Collector task failed"),
        }
        Ok(())
    }
}
