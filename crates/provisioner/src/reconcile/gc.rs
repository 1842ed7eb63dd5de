//! Deletes a workload's compute objects and releases its finalizer.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::info;

use api_types::GpuWorkload;
use api_types::WORKLOAD_FINALIZER;

use crate::infrastructure::store::WorkloadKey;
use crate::infrastructure::store::WorkloadStore;
use crate::provision::ProvisionerBackend;
use crate::reconcile::ReconcileError;

/// Outcome of one collection pass.
#[derive(Debug, PartialEq, Eq)]
pub enum Collection {
    /// Dependents still exist; the finalizer stays until they are gone.
    Pending { remaining: usize },
    /// Everything is cleaned up and the finalizer has been released.
    Finished,
}

pub struct GarbageCollector {
    backend: Arc<dyn ProvisionerBackend>,
    workloads: Arc<dyn WorkloadStore<GpuWorkload>>,
}

impl GarbageCollector {
    pub fn new(
        backend: Arc<dyn ProvisionerBackend>,
        workloads: Arc<dyn WorkloadStore<GpuWorkload>>,
    ) -> Self {
        Self { backend, workloads }
    }

    /// Deletes every compute object owned by the workload. The first
    /// deletion error aborts the pass so the finalizer is never removed
    /// while dependents might remain; deletion is confirmed by re-listing
    /// before the finalizer goes.
    pub async fn collect(&self, workload: &GpuWorkload) -> Result<Collection, ReconcileError> {
        let owned = self
            .backend
            .list_owned(workload)
            .await
            .map_err(ReconcileError::Provision)?;

        for snapshot in &owned {
            info!(
                kind = self.backend.kind(),
                name = %snapshot.name,
                workload = %workload.name_any(),
                "deleting compute object"
            );
            self.backend
                .delete_compute(&snapshot.name)
                .await
                .map_err(ReconcileError::Provision)?;
        }

        let remaining = self
            .backend
            .list_owned(workload)
            .await
            .map_err(ReconcileError::Provision)?;
        if !remaining.is_empty() {
            return Ok(Collection::Pending {
                remaining: remaining.len(),
            });
        }

        let key = WorkloadKey::from(workload);
        let mut fresh = match self.workloads.get(&key).await {
            Ok(fresh) => fresh,
            Err(err) if err.is_not_found() => return Ok(Collection::Finished),
            Err(err) => return Err(ReconcileError::Store(err)),
        };

        if fresh
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == WORKLOAD_FINALIZER))
        {
            if let Some(finalizers) = fresh.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != WORKLOAD_FINALIZER);
            }
            self.workloads
                .update(&fresh)
                .await
                .map_err(ReconcileError::Store)?;
            info!(workload = %key, "removed workload finalizer");
        }
        Ok(Collection::Finished)
    }
}
