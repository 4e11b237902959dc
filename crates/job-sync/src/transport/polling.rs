use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};

use super::{JobSet, Link, OpenRequest, RawEvent, Transport, TransportKind};
use crate::control::ControlPlane;
use crate::error::TransportError;
use crate::timers::TimerKind;

/// Fallback transport: fetches the snapshot of every attached job on a
/// fixed interval. Opening never fails and fetch errors only skip a tick.
pub struct PollingTransport {
    control: Arc<dyn ControlPlane>,
    interval: Duration,
}

impl PollingTransport {
    pub fn new(control: Arc<dyn ControlPlane>, interval: Duration) -> Self {
        Self { control, interval }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn open(&self, request: &OpenRequest) -> Result<Link, TransportError> {
        let (tx_in, rx_in) = mpsc::unbounded_channel::<RawEvent>();
        let control = self.control.clone();
        let jobs = request.jobs.clone();
        let period = self.interval;
        let guard = request.timers.arm(TimerKind::Poll);
        let stream = request.target.to_string();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !poll_once(control.as_ref(), &jobs, &tx_in, &stream).await {
                    break;
                }
            }
        });

        Ok(Link::new(TransportKind::Polling, rx_in, Some(task)))
    }
}

/// Returns `false` once the receiving side is gone.
async fn poll_once(
    control: &dyn ControlPlane,
    jobs: &JobSet,
    tx_in: &mpsc::UnboundedSender<RawEvent>,
    stream: &str,
) -> bool {
    for (job_id, kind) in jobs.snapshot() {
        match control.fetch_snapshot(kind, &job_id).await {
            Ok(snapshot) => {
                trace!(
                    target = "job_sync.poll",
                    %stream,
                    %job_id,
                    status = %snapshot.status,
                    "polled"
                );
                if tx_in.send(RawEvent::Snapshot(snapshot)).is_err() {
                    return false;
                }
            }
            Err(err) => {
                warn!(
                    target = "job_sync.poll",
                    %stream,
                    %job_id,
                    error = %err,
                    "poll failed; skipping tick"
                );
            }
        }
    }
    !tx_in.is_closed()
}
