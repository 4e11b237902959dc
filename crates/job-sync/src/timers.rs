//! Accounting for armed timers so teardown can be verified.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Dead-man timer of a streaming link.
    Heartbeat,
    /// Outbound ping interval of a WebSocket link.
    Ping,
    Backoff,
    Poll,
    CancelGrace,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimerKind::Heartbeat => "heartbeat",
            TimerKind::Ping => "ping",
            TimerKind::Backoff => "backoff",
            TimerKind::Poll => "poll",
            TimerKind::CancelGrace => "cancel_grace",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimerLedger {
    armed: Arc<Mutex<BTreeMap<TimerKind, usize>>>,
}

impl TimerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a timer as armed until the returned guard is dropped.
    pub fn arm(&self, kind: TimerKind) -> TimerGuard {
        *self.armed.lock().entry(kind).or_default() += 1;
        trace!(target = "job_sync.timers", timer = %kind, "armed");
        TimerGuard {
            armed: self.armed.clone(),
            kind,
        }
    }

    pub fn pending(&self) -> usize {
        self.armed.lock().values().sum()
    }

    pub fn pending_of(&self, kind: TimerKind) -> usize {
        self.armed.lock().get(&kind).copied().unwrap_or(0)
    }
}

#[must_use = "the timer is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TimerGuard {
    armed: Arc<Mutex<BTreeMap<TimerKind, usize>>>,
    kind: TimerKind,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        let mut armed = self.armed.lock();
        if let Some(count) = armed.get_mut(&self.kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                armed.remove(&self.kind);
            }
        }
        trace!(target = "job_sync.timers", timer = %self.kind, "released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_release_on_drop() {
        let ledger = TimerLedger::new();
        let backoff = ledger.arm(TimerKind::Backoff);
        let grace = ledger.arm(TimerKind::CancelGrace);
        let grace_again = ledger.arm(TimerKind::CancelGrace);
        assert_eq!(ledger.pending(), 3);
        assert_eq!(ledger.pending_of(TimerKind::CancelGrace), 2);

        drop(grace);
        drop(backoff);
        assert_eq!(ledger.pending(), 1);
        assert_eq!(ledger.pending_of(TimerKind::Backoff), 0);

        drop(grace_again);
        assert_eq!(ledger.pending(), 0);
    }

    #[tokio::test]
    async fn aborted_task_releases_its_guard() {
        let ledger = TimerLedger::new();
        let guard = ledger.arm(TimerKind::Poll);
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        assert_eq!(ledger.pending(), 1);
        task.abort();
        let _ = task.await;
        assert_eq!(ledger.pending(), 0);
    }
}
