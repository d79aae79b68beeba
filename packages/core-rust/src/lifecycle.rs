//! Processor lifecycle states.

use serde::Serialize;

/// Lifecycle of an SCGI processor.
///
/// State machine: Running -> (Draining | Forced) -> Dead. `Draining` may
/// still be upgraded to `Forced`; nothing leaves `Forced` except `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Accepting and dispatching requests.
    Running,
    /// Graceful shutdown: new requests are redirected, in-flight ones finish.
    Draining,
    /// Forced shutdown: the listening socket has been closed immediately.
    Forced,
    /// The accept loop has exited.
    Dead,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Forced => "forced",
            Self::Dead => "dead",
        }
    }

    /// True once either shutdown mode has been requested.
    #[must_use]
    pub fn is_shutting_down(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
