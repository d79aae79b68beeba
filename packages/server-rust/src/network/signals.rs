//! Maps process signals onto shutdown controller operations.
//!
//! * TERM -- forced shutdown
//! * INT, HUP -- graceful shutdown
//! * USR2 -- log a status snapshot with the in-flight connection table

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::connection::ConnectionRegistry;
use super::shutdown::{ShutdownController, StatusSnapshot};

/// Control-plane triggers understood by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Terminate,
    Interrupt,
    Hangup,
    StatusQuery,
}

/// One in-flight connection as listed in a status report.
#[derive(Debug, Clone, Serialize)]
pub struct InFlightConnection {
    pub id: u64,
    pub peer: SocketAddr,
    pub age_ms: u64,
}

/// Controller snapshot plus the in-flight connections, ordered by id.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub processor: StatusSnapshot,
    pub in_flight: Vec<InFlightConnection>,
}

/// Builds a status report without changing any state.
#[must_use]
pub fn status_report(controller: &ShutdownController, registry: &ConnectionRegistry) -> StatusReport {
    let in_flight = registry
        .connections()
        .into_iter()
        .map(|info| InFlightConnection {
            id: info.id.0,
            peer: info.peer,
            age_ms: u64::try_from(info.accepted_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
        .collect();
    StatusReport {
        processor: controller.dump_status(),
        in_flight,
    }
}

/// Applies one control signal to the controller.
pub fn apply(controller: &ShutdownController, registry: &ConnectionRegistry, signal: ControlSignal) {
    match signal {
        ControlSignal::Terminate => {
            info!("SIGTERM, forced shutdown.");
            controller.begin_forced_shutdown();
        }
        ControlSignal::Interrupt => {
            info!("SIGINT, graceful shutdown started.");
            controller.begin_graceful_shutdown();
        }
        ControlSignal::Hangup => {
            info!("SIGHUP, graceful shutdown started.");
            controller.begin_graceful_shutdown();
        }
        ControlSignal::StatusQuery => log_status(controller, registry),
    }
}

/// Logs the status report as JSON.
pub fn log_status(controller: &ShutdownController, registry: &ConnectionRegistry) {
    match serde_json::to_string(&status_report(controller, registry)) {
        Ok(status) => info!(%status, "Processor status"),
        Err(e) => warn!(error = %e, "Failed to serialize processor status"),
    }
}

/// Listens for process signals until the processor is `Dead`.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be registered.
#[cfg(unix)]
pub async fn handle_signals(
    controller: Arc<ShutdownController>,
    registry: Arc<ConnectionRegistry>,
) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    loop {
        let received = tokio::select! {
            () = controller.terminated() => return Ok(()),
            _ = term.recv() => ControlSignal::Terminate,
            _ = int.recv() => ControlSignal::Interrupt,
            _ = hup.recv() => ControlSignal::Hangup,
            _ = usr2.recv() => ControlSignal::StatusQuery,
        };
        apply(&controller, &registry, received);
    }
}

/// Listens for Ctrl-C until the processor is `Dead`.
///
/// # Errors
///
/// Returns an error if the Ctrl-C handler cannot be registered.
#[cfg(not(unix))]
pub async fn handle_signals(
    controller: Arc<ShutdownController>,
    registry: Arc<ConnectionRegistry>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            () = controller.terminated() => return Ok(()),
            result = tokio::signal::ctrl_c() => {
                result?;
                apply(&controller, &registry, ControlSignal::Interrupt);
            }
        }
    }
}
