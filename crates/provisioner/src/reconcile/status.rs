//! Idempotent, conflict-tolerant workload status updates.
//!
//! Every write re-fetches the object first so the update carries the latest
//! resourceVersion, and compares against the current value so unchanged
//! state never produces a write.

use std::sync::Arc;

use error_stack::Report;
use tracing::info;

use api_types::ConditionStatus;
use api_types::ConditionType;
use api_types::WorkloadCondition;
use api_types::WorkloadHandle;

use crate::infrastructure::retry::retry_on;
use crate::infrastructure::retry::DEFAULT_RETRY;
use crate::infrastructure::store::StoreError;
use crate::infrastructure::store::WorkloadKey;
use crate::infrastructure::store::WorkloadStore;

#[derive(Debug, derive_more::Display)]
pub enum StatusError {
    #[display("failed to update the {condition} condition")]
    Condition { condition: ConditionType },
    #[display("failed to update the worker node list")]
    WorkerNodes,
}

impl core::error::Error for StatusError {}

pub struct StatusReconciler<W> {
    store: Arc<dyn WorkloadStore<W>>,
}

impl<W> Clone for StatusReconciler<W> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<W> StatusReconciler<W>
where
    W: WorkloadHandle + kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn WorkloadStore<W>>) -> Self {
        Self { store }
    }

    /// Sets one condition, replacing the existing entry of the same type.
    /// A call with identical status, reason and message is a no-op that
    /// preserves the recorded transition time. A workload deleted while the
    /// update is in flight is success. Transient server errors are retried.
    pub async fn set_condition(
        &self,
        key: &WorkloadKey,
        condition: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Result<(), Report<StatusError>> {
        retry_on(
            DEFAULT_RETRY,
            |err: &StoreError| err.is_transient(),
            || {
                let store = Arc::clone(&self.store);
                let key = key.clone();
                let reason = reason.to_string();
                let message = message.to_string();
                async move {
                    let mut obj = match store.get(&key).await {
                        Ok(obj) => obj,
                        Err(err) if err.is_not_found() => return Ok(()),
                        Err(err) => return Err(err),
                    };

                    let next = WorkloadCondition::new(
                        condition,
                        status,
                        reason,
                        message,
                        obj.meta().generation,
                    );
                    if let Some(current) = obj.condition(condition) {
                        if current.same_outcome(&next) {
                            return Ok(());
                        }
                    }

                    info!(
                        workload = %key,
                        condition = %condition,
                        status = ?status,
                        reason = %next.reason,
                        "updating workload condition"
                    );
                    obj.upsert_condition(next);
                    store.update_status(&obj).await?;
                    Ok(())
                }
            },
        )
        .await
        .map_err(|err| Report::new(err).change_context(StatusError::Condition { condition }))
    }

    /// Records the worker-node set. Membership is order-irrelevant: a
    /// permutation of the stored set produces no write.
    pub async fn set_worker_nodes(
        &self,
        key: &WorkloadKey,
        nodes: &[String],
    ) -> Result<(), Report<StatusError>> {
        retry_on(
            DEFAULT_RETRY,
            |err: &StoreError| err.is_transient(),
            || {
                let store = Arc::clone(&self.store);
                let key = key.clone();
                let mut sorted: Vec<String> = nodes.to_vec();
                sorted.sort();
                async move {
                    let mut obj = match store.get(&key).await {
                        Ok(obj) => obj,
                        Err(err) if err.is_not_found() => return Ok(()),
                        Err(err) => return Err(err),
                    };

                    let mut current: Vec<String> = obj.worker_nodes().to_vec();
                    current.sort();
                    if current == sorted {
                        return Ok(());
                    }

                    info!(workload = %key, nodes = ?sorted, "updating worker node list");
                    obj.set_worker_nodes(sorted);
                    store.update_status(&obj).await?;
                    Ok(())
                }
            },
        )
        .await
        .map_err(|err| Report::new(err).change_context(StatusError::WorkerNodes))
    }
}
