//! Polls a compute object until it becomes ready or a deadline passes.

use std::time::Duration;

use error_stack::Report;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::provision::ComputeSnapshot;
use crate::provision::ProvisionError;
use crate::provision::ProvisionerBackend;

#[derive(Clone, Debug)]
pub struct ReadinessWaiter {
    poll_interval: Duration,
}

impl ReadinessWaiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Re-fetches the object on a fixed interval until Ready. A fetch error
    /// propagates immediately instead of being masked as a timeout; the
    /// shutdown token stops polling at once.
    pub async fn wait_ready(
        &self,
        backend: &dyn ProvisionerBackend,
        name: &str,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<ComputeSnapshot, Report<ProvisionError>> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly created
        // object gets one interval to settle before the first fetch.
        poll.tick().await;

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    return Err(Report::new(ProvisionError::Interrupted));
                }
                _ = &mut deadline => {
                    return Err(Report::new(ProvisionError::ReadyTimeout {
                        kind: backend.kind(),
                        name: name.to_string(),
                    }));
                }
                _ = poll.tick() => {
                    let snapshot = backend.get_compute(name).await?;
                    if snapshot.ready {
                        info!(kind = backend.kind(), name, "compute object is ready");
                        return Ok(snapshot);
                    }
                }
            }
        }
    }
}
