//! Accounts for capacity that has been requested but is not usable yet.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::info;

use api_types::GpuWorkload;

use crate::provision::ProvisionError;
use crate::provision::ProvisionerBackend;
use crate::provision::ReadinessWaiter;

/// Folds concurrently provisioning compute objects into the deficit
/// calculation, so two reconciliations racing on the same workload never
/// each create a full shortfall's worth of new nodes.
pub struct CapacityAccountant {
    backend: Arc<dyn ProvisionerBackend>,
    waiter: ReadinessWaiter,
    ready_timeout: Duration,
    shutdown: CancellationToken,
}

impl CapacityAccountant {
    pub fn new(
        backend: Arc<dyn ProvisionerBackend>,
        waiter: ReadinessWaiter,
        ready_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            waiter,
            ready_timeout,
            shutdown,
        }
    }

    /// Counts compute objects owned by the workload that match its instance
    /// type and have not yet passed the Initialized milestone, blocking on
    /// each until it is ready. Initialized objects already appear in the
    /// qualified node set through their registered nodes, so they are not
    /// counted again here.
    pub async fn count_in_flight(
        &self,
        workload: &GpuWorkload,
    ) -> Result<usize, Report<ProvisionError>> {
        let owned = self.backend.list_owned(workload).await?;

        let mut usable = 0;
        for snapshot in owned {
            if snapshot.deleting || !snapshot.matches_instance_type(&workload.spec.instance_type) {
                continue;
            }
            // Objects with no conditions yet are treated as still
            // materializing; the provisioner can lag behind the create.
            if snapshot.initialized && snapshot.reported {
                continue;
            }
            info!(
                kind = self.backend.kind(),
                name = %snapshot.name,
                "waiting for in-flight compute object"
            );
            self.waiter
                .wait_ready(
                    self.backend.as_ref(),
                    &snapshot.name,
                    self.ready_timeout,
                    &self.shutdown,
                )
                .await?;
            usable += 1;
        }
        Ok(usable)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::snapshot;
    use crate::testing::snapshot_with;
    use crate::testing::workload;
    use crate::testing::FakeBackend;

    fn accountant(backend: Arc<FakeBackend>) -> CapacityAccountant {
        CapacityAccountant::new(
            backend,
            ReadinessWaiter::new(Duration::from_secs(1)),
            Duration::from_secs(240),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn counts_only_objects_still_materializing() {
        let backend = Arc::new(FakeBackend::new());
        // Already initialized: represented by its cluster node, not counted.
        backend.insert(snapshot_with("done", "standard_nc6", true, true));
        // Still coming up: counted after the wait.
        backend.insert(snapshot_with("pending", "standard_nc6", false, true));
        backend.ready_after_gets("pending", 2);
        // Different instance type: ignored entirely.
        backend.insert(snapshot_with("other", "standard_nv12", false, true));

        let count = accountant(backend.clone())
            .count_in_flight(&workload("w1", 3, "standard_nc6"))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_on_objects_with_no_conditions_reported() {
        let backend = Arc::new(FakeBackend::new());
        let mut fresh = snapshot("fresh", false);
        fresh.instance_types = vec!["standard_nc6".to_string()];
        fresh.reported = false;
        backend.insert(fresh);
        backend.ready_after_gets("fresh", 1);

        let count = accountant(backend.clone())
            .count_in_flight(&workload("w1", 1, "standard_nc6"))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(backend.get_calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_objects_are_ignored() {
        let backend = Arc::new(FakeBackend::new());
        let mut going = snapshot_with("going", "standard_nc6", false, true);
        going.deleting = true;
        backend.insert(going);

        let count = accountant(backend)
            .count_in_flight(&workload("w1", 1, "standard_nc6"))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_wait_failure_surfaces_instead_of_being_counted() {
        let backend = Arc::new(FakeBackend::new());
        backend.insert(snapshot_with("stuck", "standard_nc6", false, true));

        let mut accountant = accountant(backend);
        accountant.ready_timeout = Duration::from_secs(3);
        let err = accountant
            .count_in_flight(&workload("w1", 1, "standard_nc6"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProvisionError::ReadyTimeout { .. }
        ));
    }
}
