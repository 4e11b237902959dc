//! Connection state machine: bounded exponential backoff, then a permanent
//! fallback to polling.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Consecutive failures tolerated before degrading to polling.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(15_000),
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// `min(base * 2^attempt, cap)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Streaming gave up; updates arrive through polling for the rest of the session.
    Degraded,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Degraded => "degraded(polling)",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempts: u32,
    pub next_delay: Duration,
    pub max_attempts: u32,
}

/// Why a link stopped.
#[derive(Debug, Clone)]
pub enum Failure {
    Transport(TransportError),
    HeartbeatTimeout(Duration),
    Closed { code: Option<u16>, clean: bool },
}

impl Failure {
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Failure::Closed { clean: true, .. })
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Transport(err) => write!(f, "{err}"),
            Failure::HeartbeatTimeout(after) => {
                write!(f, "no heartbeat for {}ms", after.as_millis())
            }
            Failure::Closed { code, clean } => {
                write!(f, "stream closed (code {code:?}, clean={clean})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Re-open the streaming transport after `delay`.
    Retry { delay: Duration, attempt: u32 },
    /// Switch to polling; streaming is not attempted again.
    Degrade,
    /// Clean close: nothing further to do.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal connection transition from {from} on {event}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub event: &'static str,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    state: ConnectionState,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        ReconnectState {
            attempts: self.attempts,
            next_delay: self.config.delay(self.attempts),
            max_attempts: self.config.max_attempts,
        }
    }

    /// `Disconnected -> Connecting`; a re-open from `Reconnecting` keeps that state.
    pub fn begin_open(&mut self) -> Result<ConnectionState, IllegalTransition> {
        match self.state {
            ConnectionState::Disconnected => self.state = ConnectionState::Connecting,
            ConnectionState::Reconnecting => {}
            from => {
                return Err(IllegalTransition {
                    from,
                    event: "open",
                })
            }
        }
        Ok(self.state)
    }

    pub fn on_connected(&mut self) -> Result<ConnectionState, IllegalTransition> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                Ok(self.state)
            }
            from => Err(IllegalTransition {
                from,
                event: "connected",
            }),
        }
    }

    pub fn on_failure(&mut self, failure: &Failure) -> Result<Decision, IllegalTransition> {
        match self.state {
            ConnectionState::Connected if failure.is_clean_close() => {
                self.state = ConnectionState::Closed;
                Ok(Decision::Stop)
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {
                self.attempts = self.attempts.saturating_add(1);
                if self.attempts >= self.config.max_attempts {
                    self.state = ConnectionState::Degraded;
                    return Ok(Decision::Degrade);
                }
                self.state = ConnectionState::Reconnecting;
                Ok(Decision::Retry {
                    delay: self.config.delay(self.attempts - 1),
                    attempt: self.attempts,
                })
            }
            from => Err(IllegalTransition {
                from,
                event: "failure",
            }),
        }
    }

    /// Skips streaming entirely (or abandons it); `Closed` stays closed.
    pub fn degrade(&mut self) -> Result<ConnectionState, IllegalTransition> {
        match self.state {
            ConnectionState::Closed => Err(IllegalTransition {
                from: ConnectionState::Closed,
                event: "degrade",
            }),
            _ => {
                self.state = ConnectionState::Degraded;
                Ok(self.state)
            }
        }
    }

    pub fn close(&mut self) -> ConnectionState {
        self.state = ConnectionState::Closed;
        self.state
    }
}
