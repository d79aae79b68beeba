//! Shutdown controller: lifecycle state, connection counters and listener closure.
//!
//! One `parking_lot::Mutex` guards the lifecycle state together with the
//! active and total connection counters, so admission checks, reclamation
//! and shutdown requests always observe a consistent triple. The controller
//! holds the only strong reference to the listening socket; closing it drops
//! that reference and cancels a `CancellationToken` so the accept loop wakes.
//! Both steps are idempotent no matter which path requests the close first.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use scgi_core::{admit, Admission, LifecycleState};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

#[derive(Debug)]
struct SharedState {
    lifecycle: LifecycleState,
    active: usize,
    total: u64,
}

/// Point-in-time view of the processor, taken under the state lock.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    /// Either shutdown mode has been requested.
    pub shutdown: bool,
    /// The accept loop has exited.
    pub dead: bool,
    pub active_connections: usize,
    pub total_connections: u64,
    pub max_connections: usize,
    pub pid: u32,
    pub started_at_unix_secs: u64,
    pub uptime_ms: u64,
    pub taken_at_unix_secs: u64,
}

/// Owns the processor lifecycle and the connection counters.
///
/// The accept loop and the collector only observe and report; every state
/// transition goes through this controller:
/// 1. `connection_opened()` / `connection_reclaimed()` keep the counters
/// 2. `admission()` answers the per-request admit-or-redirect question
/// 3. `begin_graceful_shutdown()` / `begin_forced_shutdown()` move the state
///    forward and close the listener when appropriate
/// 4. `mark_dead()` records that the accept loop has exited
#[derive(Debug)]
pub struct ShutdownController {
    state: Mutex<SharedState>,
    max_connections: usize,
    listener: Mutex<Option<Arc<TcpListener>>>,
    listener_close: CancellationToken,
    terminated: CancellationToken,
    started_at: SystemTime,
    started: Instant,
}

impl ShutdownController {
    /// Creates a controller in the `Running` state.
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            state: Mutex::new(SharedState {
                lifecycle: LifecycleState::Running,
                active: 0,
                total: 0,
            }),
            max_connections,
            listener: Mutex::new(None),
            listener_close: CancellationToken::new(),
            terminated: CancellationToken::new(),
            started_at: SystemTime::now(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }

    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.state.lock().total
    }

    /// Takes ownership of the listening socket.
    ///
    /// The accept loop borrows it through the returned `Weak`, so closing the
    /// listener releases the socket even before the loop runs. A listener
    /// adopted after a shutdown has begun is closed at once.
    pub fn adopt_listener(&self, listener: TcpListener) -> Weak<TcpListener> {
        if self.listener_close.is_cancelled() {
            return Weak::new();
        }
        let listener = Arc::new(listener);
        let handle = Arc::downgrade(&listener);
        *self.listener.lock() = Some(listener);
        handle
    }

    /// Decides whether the calling connection may reach the application.
    #[must_use]
    pub fn admission(&self) -> Admission {
        let state = self.state.lock();
        admit(state.lifecycle, state.active, self.max_connections)
    }

    /// Records a newly accepted connection. Returns the new active count.
    ///
    /// Must be called before the connection task is spawned so the task's
    /// own admission check counts itself.
    pub fn connection_opened(&self) -> usize {
        let mut state = self.state.lock();
        state.active += 1;
        record_active_gauge(state.active);
        state.active
    }

    /// Records that a connection task has been reclaimed.
    ///
    /// When a graceful shutdown is waiting on this connection, the listening
    /// socket is closed here.
    pub fn connection_reclaimed(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            state.total += 1;
            record_active_gauge(state.active);
            state.active == 0 && state.lifecycle == LifecycleState::Draining
        };

        if drained && !self.listener_close.is_cancelled() {
            info!("Last connection reclaimed. Closing listener.");
            self.close_listener();
        }
    }

    /// Starts a graceful shutdown.
    ///
    /// New requests are redirected from now on. With no active connections
    /// the listening socket is closed before this returns; otherwise it is
    /// closed when the last connection is reclaimed. Repeated calls, or calls
    /// after a forced shutdown, have no effect.
    pub fn begin_graceful_shutdown(&self) {
        let mut state = self.state.lock();
        if state.lifecycle != LifecycleState::Running {
            debug!(state = %state.lifecycle, "Graceful shutdown already in progress");
            return;
        }

        state.lifecycle = LifecycleState::Draining;
        if state.active == 0 {
            info!("Immediate shutdown since nobody is connected.");
            self.close_listener();
        } else {
            info!(
                "Shutdown requested. Beginning graceful shutdown with {} connected.",
                state.active
            );
        }
    }

    /// Starts a forced shutdown: the listening socket is closed immediately.
    ///
    /// In-flight connections are not cancelled; they run to completion or
    /// fail on their own sockets.
    pub fn begin_forced_shutdown(&self) {
        let mut state = self.state.lock();
        match state.lifecycle {
            LifecycleState::Forced | LifecycleState::Dead => {
                debug!(state = %state.lifecycle, "Forced shutdown already in progress");
            }
            LifecycleState::Running | LifecycleState::Draining => {
                state.lifecycle = LifecycleState::Forced;
                info!(
                    "Forcing shutdown with {} connected. You may see errors.",
                    state.active
                );
                self.close_listener();
            }
        }
    }

    /// True once a shutdown is in progress and no connection is outstanding.
    #[must_use]
    pub fn drain_complete(&self) -> bool {
        let state = self.state.lock();
        matches!(
            state.lifecycle,
            LifecycleState::Draining | LifecycleState::Forced
        ) && state.active == 0
    }

    /// Marks the processor `Dead`, returning the state it was in.
    pub fn mark_dead(&self) -> LifecycleState {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.lifecycle, LifecycleState::Dead)
        };
        self.close_listener();
        self.terminated.cancel();
        previous
    }

    fn close_listener(&self) {
        drop(self.listener.lock().take());
        self.listener_close.cancel();
    }

    #[must_use]
    pub fn is_listener_closed(&self) -> bool {
        self.listener_close.is_cancelled()
    }

    /// Resolves once the listening socket has been asked to close.
    pub fn listener_closed(&self) -> WaitForCancellationFuture<'_> {
        self.listener_close.cancelled()
    }

    /// Resolves once the processor is `Dead`.
    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.terminated.cancelled()
    }

    /// Returns a consistent status snapshot without changing any state.
    #[must_use]
    pub fn dump_status(&self) -> StatusSnapshot {
        let (lifecycle, active, total) = {
            let state = self.state.lock();
            (state.lifecycle, state.active, state.total)
        };

        StatusSnapshot {
            state: lifecycle,
            shutdown: lifecycle.is_shutting_down(),
            dead: lifecycle == LifecycleState::Dead,
            active_connections: active,
            total_connections: total,
            max_connections: self.max_connections,
            pid: std::process::id(),
            started_at_unix_secs: unix_secs(self.started_at),
            uptime_ms: duration_ms(self.started.elapsed()),
            taken_at_unix_secs: unix_secs(SystemTime::now()),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_active_gauge(active: usize) {
    metrics::gauge!("scgi_connections_active").set(active as f64);
}

fn unix_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use metrics::{
        Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use tokio::net::TcpStream;

    use super::*;

    /// Records every gauge update and whether the state lock was held.
    struct LockCheckingGauge {
        controller: Arc<ShutdownController>,
        published: Mutex<Vec<(f64, bool)>>,
    }

    impl GaugeFn for LockCheckingGauge {
        fn increment(&self, _value: f64) {}

        fn decrement(&self, _value: f64) {}

        fn set(&self, value: f64) {
            let held = self.controller.state.try_lock().is_none();
            self.published.lock().push((value, held));
        }
    }

    struct GaugeRecorder(Arc<LockCheckingGauge>);

    impl Recorder for GaugeRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::from_arc(Arc::clone(&self.0))
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn initial_state_is_running() {
        let controller = ShutdownController::new(10);
        assert_eq!(controller.state(), LifecycleState::Running);
        assert_eq!(controller.active_count(), 0);
        assert_eq!(controller.total_count(), 0);
        assert!(!controller.is_listener_closed());
        assert_eq!(controller.admission(), Admission::Admit);
    }

    #[test]
    fn counters_track_open_and_reclaim() {
        let controller = ShutdownController::new(10);
        assert_eq!(controller.connection_opened(), 1);
        assert_eq!(controller.connection_opened(), 2);

        controller.connection_reclaimed();
        assert_eq!(controller.active_count(), 1);
        assert_eq!(controller.total_count(), 1);

        controller.connection_reclaimed();
        assert_eq!(controller.active_count(), 0);
        assert_eq!(controller.total_count(), 2);
    }

    #[test]
    fn admission_redirects_over_limit() {
        let controller = ShutdownController::new(1);
        controller.connection_opened();
        assert_eq!(controller.admission(), Admission::Admit);

        controller.connection_opened();
        assert_eq!(controller.admission(), Admission::Redirect);
    }

    #[test]
    fn zero_max_connections_redirects_every_connection() {
        let controller = ShutdownController::new(0);
        controller.connection_opened();
        assert_eq!(controller.admission(), Admission::Redirect);
    }

    #[test]
    fn graceful_shutdown_when_idle_closes_listener_immediately() {
        let controller = ShutdownController::new(10);
        controller.begin_graceful_shutdown();

        assert_eq!(controller.state(), LifecycleState::Draining);
        assert!(controller.is_listener_closed());
        assert!(controller.drain_complete());
    }

    #[test]
    fn graceful_shutdown_waits_for_last_connection() {
        let controller = ShutdownController::new(10);
        controller.connection_opened();
        controller.connection_opened();

        controller.begin_graceful_shutdown();
        assert_eq!(controller.state(), LifecycleState::Draining);
        assert!(!controller.is_listener_closed());
        assert_eq!(controller.admission(), Admission::Redirect);

        controller.connection_reclaimed();
        assert!(!controller.is_listener_closed());
        assert!(!controller.drain_complete());

        controller.connection_reclaimed();
        assert!(controller.is_listener_closed());
        assert!(controller.drain_complete());
    }

    #[test]
    fn graceful_shutdown_is_idempotent() {
        let controller = ShutdownController::new(10);
        controller.connection_opened();
        controller.begin_graceful_shutdown();
        controller.begin_graceful_shutdown();
        assert_eq!(controller.state(), LifecycleState::Draining);
        assert!(!controller.is_listener_closed());
    }

    #[test]
    fn forced_shutdown_closes_listener_with_active_connections() {
        let controller = ShutdownController::new(10);
        controller.connection_opened();

        controller.begin_forced_shutdown();
        assert_eq!(controller.state(), LifecycleState::Forced);
        assert!(controller.is_listener_closed());
        assert!(!controller.drain_complete());
        assert_eq!(controller.admission(), Admission::Redirect);
    }

    #[test]
    fn forced_overrides_draining_but_not_the_reverse() {
        let controller = ShutdownController::new(10);
        controller.connection_opened();

        controller.begin_graceful_shutdown();
        controller.begin_forced_shutdown();
        assert_eq!(controller.state(), LifecycleState::Forced);

        controller.begin_graceful_shutdown();
        assert_eq!(controller.state(), LifecycleState::Forced);
    }

    #[test]
    fn mark_dead_is_terminal() {
        let controller = ShutdownController::new(10);
        controller.begin_forced_shutdown();

        assert_eq!(controller.mark_dead(), LifecycleState::Forced);
        assert_eq!(controller.state(), LifecycleState::Dead);

        controller.begin_forced_shutdown();
        controller.begin_graceful_shutdown();
        assert_eq!(controller.state(), LifecycleState::Dead);
    }

    #[test]
    fn dump_status_reports_without_mutating() {
        let controller = ShutdownController::new(5);
        controller.connection_opened();
        controller.connection_opened();
        controller.connection_reclaimed();

        let status = controller.dump_status();
        assert_eq!(status.state, LifecycleState::Running);
        assert!(!status.shutdown);
        assert!(!status.dead);
        assert_eq!(status.active_connections, 1);
        assert_eq!(status.total_connections, 1);
        assert_eq!(status.max_connections, 5);
        assert_eq!(status.pid, std::process::id());
        assert!(status.taken_at_unix_secs >= status.started_at_unix_secs);

        assert_eq!(controller.active_count(), 1);
        assert_eq!(controller.state(), LifecycleState::Running);
    }

    #[test]
    fn dump_status_serializes_state_name() {
        let controller = ShutdownController::new(5);
        controller.begin_graceful_shutdown();
        let json = serde_json::to_value(controller.dump_status()).unwrap();
        assert_eq!(json["state"], "draining");
        assert_eq!(json["shutdown"], true);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn active_gauge_is_published_under_the_state_lock() {
        let controller = Arc::new(ShutdownController::new(10));
        let gauge = Arc::new(LockCheckingGauge {
            controller: Arc::clone(&controller),
            published: Mutex::new(Vec::new()),
        });
        let recorder = GaugeRecorder(Arc::clone(&gauge));

        metrics::with_local_recorder(&recorder, || {
            controller.connection_opened();
            controller.connection_opened();
            controller.connection_reclaimed();
        });

        assert_eq!(
            *gauge.published.lock(),
            vec![(1.0, true), (2.0, true), (1.0, true)]
        );
    }

    #[tokio::test]
    async fn graceful_shutdown_releases_adopted_listener() {
        let controller = ShutdownController::new(10);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = controller.adopt_listener(listener);
        assert!(handle.upgrade().is_some());

        controller.begin_graceful_shutdown();

        assert!(handle.upgrade().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn listener_adopted_after_shutdown_is_closed_at_once() {
        let controller = ShutdownController::new(10);
        controller.begin_forced_shutdown();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = controller.adopt_listener(listener);

        assert!(handle.upgrade().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn draining_keeps_listener_until_last_reclaim() {
        let controller = ShutdownController::new(10);
        let handle = controller.adopt_listener(TcpListener::bind("127.0.0.1:0").await.unwrap());
        controller.connection_opened();

        controller.begin_graceful_shutdown();
        assert!(handle.upgrade().is_some());

        controller.connection_reclaimed();
        assert!(handle.upgrade().is_none());
    }

    #[tokio::test]
    async fn terminated_resolves_after_mark_dead() {
        let controller = Arc::new(ShutdownController::new(5));
        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.terminated().await })
        };

        controller.mark_dead();
        waiter.await.unwrap();
        assert!(controller.is_listener_closed());
    }
}
