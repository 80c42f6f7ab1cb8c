//! Connection lifecycle for the kernel channels socket.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected | Dead
//!                     |
//!                     +-> Disconnected (connect failed)
//! ```
//!
//! After a lost connection the tracker either schedules a retry with
//! exponentially increasing delay or, once the retry budget is spent,
//! moves to `Dead`. `Dead` is terminal until `reset` is called or the
//! connection is closed on request.

use std::time::Duration;

use serde::Serialize;

/// Observable state of the kernel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted; requires an explicit reconnect.
    Dead,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Dead => write!(f, "dead"),
        }
    }
}

/// Exponential backoff with a fixed number of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    limit: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 7)
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, limit: u32) -> Self {
        Self { base_delay, limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// retry budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.limit {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}

/// What the transport should do after losing its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Retry { attempt: u32, delay: Duration },
    Dead,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid connection transition: {event} while {from}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: &'static str,
}

/// Tracks connection state and the reconnect attempt counter.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
}

impl ConnectionTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn invalid(&self, event: &'static str) -> TransitionError {
        TransitionError {
            from: self.state,
            event,
        }
    }

    /// A connection attempt is starting.
    pub fn begin_connect(&mut self) -> Result<(), TransitionError> {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            _ => Err(self.invalid("connect")),
        }
    }

    /// The socket opened; the retry budget is restored.
    pub fn opened(&mut self) -> Result<(), TransitionError> {
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Connected;
                self.attempt = 0;
                Ok(())
            }
            _ => Err(self.invalid("open")),
        }
    }

    /// The socket failed to open or closed without being asked to.
    pub fn lost(&mut self) -> Result<NextStep, TransitionError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                match self.policy.delay_for(self.attempt) {
                    Some(delay) => {
                        self.state = ConnectionState::Disconnected;
                        self.attempt += 1;
                        Ok(NextStep::Retry {
                            attempt: self.attempt,
                            delay,
                        })
                    }
                    None => {
                        self.state = ConnectionState::Dead;
                        Ok(NextStep::Dead)
                    }
                }
            }
            _ => Err(self.invalid("lose")),
        }
    }

    /// The connection was closed on request; no retry follows. This also
    /// leaves `Dead`, since nothing is waiting to reconnect any more.
    pub fn closed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Explicit user reconnect: leave `Dead` with a fresh retry budget.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
    }
}
