//! Admission control: dispatch a request or answer it with a busy redirect.
//!
//! The decision is taken before any backend work, so an overloaded or
//! shutting-down processor turns requests away at constant cost.

use crate::lifecycle::LifecycleState;

/// Connection limit used when none is configured.
pub const DEFAULT_MAX_CONNECTIONS: usize = (1 << 30) - 1;

/// Response written verbatim to every connection that is not admitted.
pub const BUSY_RESPONSE: &[u8] = b"Location: /busy.html\r\n\
Cache-control: no-cache, must-revalidate\r\n\
Expires: Mon, 26 Jul 1997 05:00:00 GMT\r\n\
Status: 307 Temporary Redirect\r\n\
\r\n";

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Hand the request to the application handler.
    Admit,
    /// Write [`BUSY_RESPONSE`] and close.
    Redirect,
}

/// Decides whether a request may reach the application handler.
///
/// `active_connections` counts every connection that has been accepted and
/// not yet reclaimed, including the one being decided.
#[must_use]
pub fn admit(
    state: LifecycleState,
    active_connections: usize,
    max_connections: usize,
) -> Admission {
    if state.is_shutting_down() || active_connections > max_connections {
        Admission::Redirect
    } else {
        Admission::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_under_limit_admits() {
        assert_eq!(admit(LifecycleState::Running, 0, 10), Admission::Admit);
        assert_eq!(admit(LifecycleState::Running, 10, 10), Admission::Admit);
    }

    #[test]
    fn over_limit_redirects() {
        assert_eq!(admit(LifecycleState::Running, 11, 10), Admission::Redirect);
        assert_eq!(admit(LifecycleState::Running, 1, 0), Admission::Redirect);
    }

    #[test]
    fn any_shutdown_state_redirects() {
        for state in [
            LifecycleState::Draining,
            LifecycleState::Forced,
            LifecycleState::Dead,
        ] {
            assert_eq!(admit(state, 0, DEFAULT_MAX_CONNECTIONS), Admission::Redirect);
        }
    }

    #[test]
    fn busy_response_is_exact() {
        let expected = "Location: /busy.html\r\n\
                        Cache-control: no-cache, must-revalidate\r\n\
                        Expires: Mon, 26 Jul 1997 05:00:00 GMT\r\n\
                        Status: 307 Temporary Redirect\r\n\r\n";
        assert_eq!(BUSY_RESPONSE, expected.as_bytes());
        assert!(BUSY_RESPONSE.starts_with(b"Location: /busy.html\r\nCache-control"));
        assert!(BUSY_RESPONSE.ends_with(b"Redirect\r\n\r\n"));
    }
}
