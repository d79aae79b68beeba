//! Connection registry and collector.
//!
//! Every accepted connection gets an id and an entry in a `DashMap` table
//! for diagnostics. Its task handle is submitted to the [`Collector`], which
//! reclaims tasks in completion order: it removes the table entry, updates
//! the counters on the [`ShutdownController`], and logs join failures.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use super::shutdown::ShutdownController;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Diagnostic record of an in-flight connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub accepted_at: Instant,
}

/// Table of in-flight connections, indexed by id.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionInfo>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    ///
    /// Connection IDs start at 1 (0 is reserved as "no connection").
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Records a newly accepted connection and returns its id.
    pub fn register(&self, peer: SocketAddr) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                peer,
                accepted_at: Instant::now(),
            },
        );
        id
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.remove(&id).map(|(_, info)| info)
    }

    /// Returns all in-flight connections ordered by id.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|info| info.id);
        all
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A spawned connection task awaiting reclamation.
#[derive(Debug)]
pub struct PendingConnection {
    pub id: ConnectionId,
    pub task: JoinHandle<()>,
}

/// Submits connection tasks to a [`Collector`].
///
/// Dropping the last submitter tells the collector to finish the tasks it
/// already knows about and exit.
#[derive(Debug, Clone)]
pub struct TaskSubmitter {
    tx: mpsc::UnboundedSender<PendingConnection>,
}

impl TaskSubmitter {
    /// Hands a task to the collector.
    ///
    /// Returns the pending connection back if the collector has exited.
    ///
    /// # Errors
    ///
    /// Fails only when the collector is no longer running.
    pub fn submit(&self, id: ConnectionId, task: JoinHandle<()>) -> Result<(), PendingConnection> {
        self.tx
            .send(PendingConnection { id, task })
            .map_err(|rejected| rejected.0)
    }
}

/// Reclaims finished connection tasks.
#[derive(Debug)]
pub struct Collector {
    rx: mpsc::UnboundedReceiver<PendingConnection>,
    registry: Arc<ConnectionRegistry>,
    controller: Arc<ShutdownController>,
}

/// Creates a connected submitter/collector pair.
#[must_use]
pub fn collector_channel(
    registry: Arc<ConnectionRegistry>,
    controller: Arc<ShutdownController>,
) -> (TaskSubmitter, Collector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        TaskSubmitter { tx },
        Collector {
            rx,
            registry,
            controller,
        },
    )
}

async fn join_pending(pending: PendingConnection) -> (ConnectionId, Result<(), JoinError>) {
    (pending.id, pending.task.await)
}

impl Collector {
    /// Runs until every submitter is dropped and all submitted tasks have
    /// been reclaimed. Returns the number of tasks reclaimed.
    pub async fn run(mut self) -> u64 {
        let mut pending = FuturesUnordered::new();
        let mut accepting = true;
        let mut reclaimed = 0u64;

        loop {
            tokio::select! {
                submitted = self.rx.recv(), if accepting => match submitted {
                    Some(task) => pending.push(join_pending(task)),
                    None => accepting = false,
                },
                Some((id, result)) = pending.next(), if !pending.is_empty() => {
                    self.reclaim(id, result);
                    reclaimed += 1;
                }
                else => break,
            }
        }

        debug!(reclaimed, "Collector exited");
        reclaimed
    }

    fn reclaim(&self, id: ConnectionId, result: Result<(), JoinError>) {
        let info = self.registry.remove(id);

        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                info!(connection = %id, "Connection task interrupted during shutdown");
            }
            Err(e) => {
                error!(connection = %id, error = %e, "Connection task panicked");
            }
        }

        if let Some(info) = info {
            debug!(
                connection = %id,
                peer = %info.peer,
                elapsed = ?info.accepted_at.elapsed(),
                "Reclaimed connection"
            );
        }

        metrics::counter!("scgi_connections_reclaimed_total").increment(1);
        self.controller.connection_reclaimed();
    }
}
