//! Liveness tracking for a connected streaming link.

use std::future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};

use crate::timers::{TimerGuard, TimerKind, TimerLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Nothing arrived within the timeout.
    Expired(Duration),
    /// Time to send an outbound ping.
    Ping,
}

/// Dead-man timer plus an optional ping interval. Both timers belong to the
/// monitor and are released when it is dropped.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    ping: Option<Interval>,
    _guards: Vec<TimerGuard>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration, ping_every: Option<Duration>, timers: &TimerLedger) -> Self {
        let mut guards = vec![timers.arm(TimerKind::Heartbeat)];
        let ping = ping_every.map(|period| {
            guards.push(timers.arm(TimerKind::Ping));
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            timeout,
            deadline: Box::pin(time::sleep(timeout)),
            ping,
            _guards: guards,
        }
    }

    /// Any inbound traffic counts as proof of life.
    pub fn touch(&mut self) {
        let next = Instant::now() + self.timeout;
        self.deadline.as_mut().reset(next);
    }

    /// Resolves at the next expiry or ping. Cancel safe.
    pub async fn next(&mut self) -> Beat {
        let timeout = self.timeout;
        let ping = &mut self.ping;
        tokio::select! {
            _ = self.deadline.as_mut() => Beat::Expired(timeout),
            _ = next_ping(ping) => Beat::Ping,
        }
    }
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}
