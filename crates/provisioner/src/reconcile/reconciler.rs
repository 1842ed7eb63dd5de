//! Reconciles GpuWorkload objects against the cluster's compute capacity.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::Client;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use api_types::sku;
use api_types::ComputeCondition;
use api_types::ConditionStatus;
use api_types::ConditionType;
use api_types::GpuWorkload;
use api_types::Machine;
use api_types::NodeClaim;
use api_types::CONDITION_READY;
use api_types::LABEL_ACCELERATOR;
use api_types::LABEL_ACCELERATOR_NVIDIA;
use api_types::WorkloadHandle;
use api_types::LABEL_WORKLOAD_NAME;
use api_types::LABEL_WORKLOAD_NAMESPACE;
use api_types::WORKLOAD_FINALIZER;

use crate::config::BackendChoice;
use crate::config::Settings;
use crate::domain::node_selector::select_nodes;
use crate::domain::node_selector::NodeSelector;
use crate::infrastructure::store::KubeStore;
use crate::infrastructure::store::NodeStore;
use crate::infrastructure::store::WorkloadKey;
use crate::infrastructure::store::WorkloadStore;
use crate::provision::CapacityAccountant;
use crate::provision::MachineBackend;
use crate::provision::NodeClaimBackend;
use crate::provision::ProvisionerBackend;
use crate::provision::ReadinessWaiter;
use crate::reconcile::Collection;
use crate::reconcile::GarbageCollector;
use crate::reconcile::ReconcileError;
use crate::reconcile::StatusReconciler;

const PENDING_DELETION_REQUEUE: Duration = Duration::from_secs(10);
const RESYNC_REQUEUE: Duration = Duration::from_secs(600);

/// Shared state for every reconciliation. Built once at startup; the
/// backend variant is fixed here and never re-evaluated per call.
pub struct Context {
    pub settings: Settings,
    pub workloads: Arc<dyn WorkloadStore<GpuWorkload>>,
    pub nodes: Arc<dyn NodeStore>,
    pub selector: NodeSelector,
    pub backend: Arc<dyn ProvisionerBackend>,
    pub status: StatusReconciler<GpuWorkload>,
    pub waiter: ReadinessWaiter,
    pub accountant: CapacityAccountant,
    pub gc: GarbageCollector,
    pub shutdown: CancellationToken,
}

impl Context {
    pub fn new(client: Client, settings: Settings, shutdown: CancellationToken) -> Self {
        let store = Arc::new(KubeStore::new(client));
        let backend: Arc<dyn ProvisionerBackend> = match &settings.backend {
            BackendChoice::Machine => Arc::new(MachineBackend::new(store.clone())),
            BackendChoice::NodeClaim {
                cloud,
                cluster_name,
            } => Arc::new(NodeClaimBackend::new(
                store.clone(),
                store.clone(),
                store.clone(),
                *cloud,
                cluster_name.clone(),
            )),
        };
        let waiter = ReadinessWaiter::new(settings.readiness_poll_interval);

        Self {
            workloads: store.clone(),
            nodes: store.clone(),
            selector: NodeSelector::new(store.clone()),
            status: StatusReconciler::new(store.clone()),
            accountant: CapacityAccountant::new(
                backend.clone(),
                waiter.clone(),
                settings.node_ready_timeout,
                shutdown.clone(),
            ),
            gc: GarbageCollector::new(backend.clone(), store),
            backend,
            waiter,
            settings,
            shutdown,
        }
    }
}

/// Entry point driven by the controller runtime.
#[instrument(skip(workload, ctx), fields(workload = %workload.name_any()))]
pub async fn reconcile(
    workload: Arc<GpuWorkload>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let key = WorkloadKey::from(workload.as_ref());
    info!(workload = %key, "reconciling");

    if workload.metadata.deletion_timestamp.is_some() {
        return delete_workload(&workload, &ctx, &key).await;
    }

    ensure_finalizer(&workload, &ctx).await?;

    match apply_capacity(&workload, &ctx, &key).await {
        Ok(worker_nodes) => {
            ctx.status
                .set_condition(
                    &key,
                    ConditionType::Failed,
                    ConditionStatus::False,
                    "ProvisioningHealthy",
                    "no provisioning failures",
                )
                .await?;
            ctx.status
                .set_condition(
                    &key,
                    ConditionType::Ready,
                    ConditionStatus::True,
                    "WorkloadReady",
                    &format!("{} worker nodes are backing the workload", worker_nodes.len()),
                )
                .await?;
            Ok(Action::requeue(RESYNC_REQUEUE))
        }
        Err(err) if err.is_permanent() => {
            warn!(workload = %key, "permanent provisioning failure: {err}");
            ctx.status
                .set_condition(
                    &key,
                    ConditionType::Failed,
                    ConditionStatus::True,
                    "ProvisioningFailed",
                    &err.to_string(),
                )
                .await?;
            // Requeueing cannot fix exhausted capacity; wait for a spec edit.
            Ok(Action::await_change())
        }
        Err(err) => {
            ctx.status
                .set_condition(
                    &key,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    "ReconcileFailed",
                    &err.to_string(),
                )
                .await?;
            Err(err)
        }
    }
}

async fn delete_workload(
    workload: &GpuWorkload,
    ctx: &Context,
    key: &WorkloadKey,
) -> Result<Action, ReconcileError> {
    ctx.status
        .set_condition(
            key,
            ConditionType::Deleting,
            ConditionStatus::True,
            "WorkloadDeleting",
            "workload is being deleted",
        )
        .await?;

    match ctx.gc.collect(workload).await? {
        Collection::Pending { remaining } => {
            info!(workload = %key, remaining, "compute objects still terminating");
            Ok(Action::requeue(PENDING_DELETION_REQUEUE))
        }
        Collection::Finished => Ok(Action::await_change()),
    }
}

async fn ensure_finalizer(workload: &GpuWorkload, ctx: &Context) -> Result<(), ReconcileError> {
    let has_finalizer = workload
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == WORKLOAD_FINALIZER));
    if has_finalizer {
        return Ok(());
    }

    let mut updated = workload.clone();
    updated
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(WORKLOAD_FINALIZER.to_string());
    ctx.workloads
        .update(&updated)
        .await
        .map_err(ReconcileError::Store)?;
    Ok(())
}

/// The capacity pass: qualify existing nodes, fold in in-flight compute
/// objects, create the remaining shortfall, and record the result.
async fn apply_capacity(
    workload: &GpuWorkload,
    ctx: &Context,
    key: &WorkloadKey,
) -> Result<Vec<String>, ReconcileError> {
    if sku::lookup(&workload.spec.instance_type).is_none() {
        return Err(ReconcileError::Provision(
            error_stack::Report::new(crate::provision::ProvisionError::UnsupportedInstanceType {
                instance_type: workload.spec.instance_type.clone(),
            })
            .attach_printable(format!(
                "supported instance types: {}",
                sku::supported_skus()
            )),
        ));
    }

    // Wait for capacity already being provisioned before deciding whether
    // to create more; racing reconciliations otherwise double-provision.
    let in_flight = ctx.accountant.count_in_flight(workload).await?;

    let qualified = ctx
        .selector
        .qualified_nodes(workload)
        .await
        .map_err(ReconcileError::Store)?;
    let count = usize::try_from(workload.spec.count).unwrap_or(0);
    let selected = select_nodes(
        qualified,
        &workload.spec.preferred_nodes,
        workload.worker_nodes(),
        count,
    );
    let mut worker_nodes: Vec<String> = selected.iter().map(|n| n.name_any()).collect();

    let needed = count
        .saturating_sub(worker_nodes.len())
        .saturating_sub(in_flight);
    if needed > 0 {
        info!(workload = %key, needed, in_flight, "creating additional compute nodes");
        ctx.status
            .set_condition(
                key,
                ConditionType::ResourceProvisioningStarted,
                ConditionStatus::True,
                "CreateNodesPending",
                &format!("creating {needed} compute nodes"),
            )
            .await?;

        let storage = workload.spec.storage.clone().unwrap_or_else(|| "0".to_string());
        for _ in 0..needed {
            let created = match ctx.backend.create_node(workload, &storage).await {
                Ok(created) => created,
                Err(report) => {
                    fail_resource(ctx, key, &format!("{report}")).await?;
                    return Err(ReconcileError::Provision(report));
                }
            };

            let ready = match ctx
                .waiter
                .wait_ready(
                    ctx.backend.as_ref(),
                    &created.name,
                    ctx.settings.node_ready_timeout,
                    &ctx.shutdown,
                )
                .await
            {
                Ok(ready) => ready,
                Err(report) => {
                    fail_resource(ctx, key, &format!("{report}")).await?;
                    return Err(ReconcileError::Provision(report));
                }
            };

            match ready.node_name {
                Some(node_name) => worker_nodes.push(node_name),
                None => {
                    let report = error_stack::Report::new(
                        crate::provision::ProvisionError::NodeNameMissing {
                            kind: ctx.backend.kind(),
                            name: ready.name.clone(),
                        },
                    );
                    fail_resource(ctx, key, &format!("{report}")).await?;
                    return Err(ReconcileError::Provision(report));
                }
            }
        }
    }

    ensure_gpu_node_labels(ctx, &worker_nodes).await?;

    ctx.status.set_worker_nodes(key, &worker_nodes).await?;
    ctx.status
        .set_condition(
            key,
            ConditionType::ResourceProvisioned,
            ConditionStatus::True,
            "NodesReady",
            "all requested nodes are provisioned and ready",
        )
        .await?;

    Ok(worker_nodes)
}

async fn fail_resource(ctx: &Context, key: &WorkloadKey, message: &str) -> Result<(), ReconcileError> {
    ctx.status
        .set_condition(
            key,
            ConditionType::ResourceProvisioned,
            ConditionStatus::False,
            "NodeProvisioningFailed",
            message,
        )
        .await?;
    Ok(())
}

/// Stamps the accelerator label onto worker nodes so the device-plugin
/// daemonset targets them. Nodes already labeled are left alone.
async fn ensure_gpu_node_labels(ctx: &Context, nodes: &[String]) -> Result<(), ReconcileError> {
    for name in nodes {
        let node = ctx.nodes.get(name).await.map_err(ReconcileError::Store)?;
        let already = node
            .metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(LABEL_ACCELERATOR));
        if !already {
            ctx.nodes
                .set_label(name, LABEL_ACCELERATOR, LABEL_ACCELERATOR_NVIDIA)
                .await
                .map_err(ReconcileError::Store)?;
        }
    }
    Ok(())
}

/// Retry schedule applied by the controller runtime after a failed
/// reconciliation, tiered by how quickly the failure might clear.
pub fn error_policy(
    _workload: Arc<GpuWorkload>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    let delay = match error {
        ReconcileError::Store(err) if err.is_transient() => Duration::from_secs(10),
        ReconcileError::Store(_) => Duration::from_secs(30),
        ReconcileError::Provision(_) => Duration::from_secs(30),
        ReconcileError::Status(_) => Duration::from_secs(15),
    };
    Action::requeue(delay)
}

fn compute_event_maps_to_workload(
    labels: Option<&std::collections::BTreeMap<String, String>>,
    conditions: &[ComputeCondition],
    deleting: bool,
) -> Option<ObjectRef<GpuWorkload>> {
    let labels = labels?;
    let name = labels.get(LABEL_WORKLOAD_NAME)?;
    let namespace = labels.get(LABEL_WORKLOAD_NAMESPACE)?;

    // A ready, live compute object needs no reconciliation.
    let ready = conditions
        .iter()
        .any(|c| c.type_ == CONDITION_READY && c.status == "True");
    if ready && !deleting {
        return None;
    }
    Some(ObjectRef::new(name).within(namespace))
}

fn machine_to_workload(machine: Machine) -> Option<ObjectRef<GpuWorkload>> {
    compute_event_maps_to_workload(
        machine.metadata.labels.as_ref(),
        machine
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[]),
        machine.metadata.deletion_timestamp.is_some(),
    )
}

fn node_claim_to_workload(claim: NodeClaim) -> Option<ObjectRef<GpuWorkload>> {
    compute_event_maps_to_workload(
        claim.metadata.labels.as_ref(),
        claim
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[]),
        claim.metadata.deletion_timestamp.is_some(),
    )
}

/// Runs the controller until the shutdown token fires. Events for the same
/// workload are coalesced by the runtime's work queue; distinct workloads
/// reconcile in parallel up to the configured concurrency.
pub async fn run(client: Client, settings: Settings, shutdown: CancellationToken) {
    let context = Arc::new(Context::new(client.clone(), settings.clone(), shutdown.clone()));
    let workloads = Api::<GpuWorkload>::all(client.clone());

    let controller = Controller::new(workloads, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(settings.concurrency));
    let controller = match &settings.backend {
        BackendChoice::Machine => controller.watches(
            Api::<Machine>::all(client.clone()),
            watcher::Config::default(),
            machine_to_workload,
        ),
        BackendChoice::NodeClaim { .. } => controller.watches(
            Api::<NodeClaim>::all(client.clone()),
            watcher::Config::default(),
            node_claim_to_workload,
        ),
    };

    controller
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, context)
        .for_each(|result| async {
            match result {
                Ok((workload, _action)) => debug!(workload = %workload, "reconciled"),
                Err(err) => warn!("reconciliation failed: {err}"),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::deleting_workload;
    use crate::testing::node_with_labels;
    use crate::testing::ready_node;
    use crate::testing::snapshot;
    use crate::testing::snapshot_with;
    use crate::testing::workload;
    use crate::testing::FakeBackend;
    use crate::testing::FakeNodeStore;
    use crate::testing::FakeWorkloadStore;

    fn context(
        backend: Arc<FakeBackend>,
        workloads: Arc<FakeWorkloadStore>,
        nodes: Arc<FakeNodeStore>,
    ) -> Context {
        let settings = Settings {
            backend: BackendChoice::Machine,
            node_ready_timeout: Duration::from_secs(60),
            readiness_poll_interval: Duration::from_secs(1),
            concurrency: 5,
        };
        let shutdown = CancellationToken::new();
        let waiter = ReadinessWaiter::new(settings.readiness_poll_interval);
        Context {
            selector: NodeSelector::new(nodes.clone()),
            status: StatusReconciler::new(workloads.clone()),
            accountant: CapacityAccountant::new(
                backend.clone(),
                waiter.clone(),
                settings.node_ready_timeout,
                shutdown.clone(),
            ),
            gc: GarbageCollector::new(backend.clone(), workloads.clone()),
            workloads,
            nodes,
            backend,
            waiter,
            settings,
            shutdown,
        }
    }

    fn key() -> WorkloadKey {
        WorkloadKey::new("default", "w1")
    }

    #[tokio::test(start_paused = true)]
    async fn shortfall_is_provisioned_and_recorded() {
        let backend = Arc::new(FakeBackend::new());
        let workloads = Arc::new(FakeWorkloadStore::with_workload(workload(
            "w1",
            2,
            "standard_nc6",
        )));
        // The node the fake backend will materialize has registered but is
        // not Ready yet, so selection cannot see it.
        let nodes = Arc::new(FakeNodeStore::with_nodes(vec![
            ready_node("existing"),
            node_with_labels("node-gw-fake-0", BTreeMap::new(), false),
        ]));
        let ctx = context(backend.clone(), workloads.clone(), nodes.clone());
        let w = workloads.stored().unwrap();

        let worker_nodes = apply_capacity(&w, &ctx, &key()).await.unwrap();

        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            worker_nodes,
            vec!["existing".to_string(), "node-gw-fake-0".to_string()]
        );

        let stored = workloads.stored().unwrap();
        let status = stored.status.as_ref().unwrap();
        assert_eq!(
            status.worker_nodes,
            vec!["existing".to_string(), "node-gw-fake-0".to_string()]
        );
        let provisioned = stored.condition(ConditionType::ResourceProvisioned).unwrap();
        assert_eq!(provisioned.status, ConditionStatus::True);
        assert_eq!(nodes.set_label_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_workload_creates_nothing() {
        let backend = Arc::new(FakeBackend::new());
        let mut w = workload("w1", 1, "standard_nc6");
        w.set_worker_nodes(vec!["existing".to_string()]);
        let workloads = Arc::new(FakeWorkloadStore::with_workload(w));
        let nodes = Arc::new(FakeNodeStore::with_nodes(vec![ready_node("existing")]));
        let ctx = context(backend.clone(), workloads.clone(), nodes);
        let w = workloads.stored().unwrap();

        let worker_nodes = apply_capacity(&w, &ctx, &key()).await.unwrap();

        assert_eq!(worker_nodes, vec!["existing".to_string()]);
        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 0);
        // Only the ResourceProvisioned condition is written; the unchanged
        // worker list is a no-op.
        assert_eq!(workloads.update_status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_capacity_suppresses_new_creates() {
        let backend = Arc::new(FakeBackend::new());
        backend.insert(snapshot_with("gw-pending", "standard_nc6", false, true));
        backend.ready_after_gets("gw-pending", 1);
        let workloads = Arc::new(FakeWorkloadStore::with_workload(workload(
            "w1",
            1,
            "standard_nc6",
        )));
        let nodes = Arc::new(FakeNodeStore::with_nodes(Vec::new()));
        let ctx = context(backend.clone(), workloads.clone(), nodes);
        let w = workloads.stored().unwrap();

        let worker_nodes = apply_capacity(&w, &ctx, &key()).await.unwrap();

        assert!(worker_nodes.is_empty());
        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_instance_type_fails_permanently() {
        let backend = Arc::new(FakeBackend::new());
        let workloads = Arc::new(FakeWorkloadStore::with_workload(workload(
            "w1",
            1,
            "standard_d2s_v3",
        )));
        let nodes = Arc::new(FakeNodeStore::with_nodes(Vec::new()));
        let ctx = Arc::new(context(backend.clone(), workloads.clone(), nodes));
        let w = Arc::new(workloads.stored().unwrap());

        let action = reconcile(w, ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 0);
        let stored = workloads.stored().unwrap();
        let failed = stored.condition(ConditionType::Failed).unwrap();
        assert_eq!(failed.status, ConditionStatus::True);
        assert_eq!(failed.reason, "ProvisioningFailed");
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_collects_dependents_and_releases_the_finalizer() {
        let backend = Arc::new(FakeBackend::new());
        backend.insert(snapshot("gw1", true));
        let workloads = Arc::new(FakeWorkloadStore::with_workload(deleting_workload("w1")));
        let nodes = Arc::new(FakeNodeStore::with_nodes(Vec::new()));
        let ctx = Arc::new(context(backend.clone(), workloads.clone(), nodes));
        let w = Arc::new(workloads.stored().unwrap());

        let action = reconcile(w, ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 1);
        let stored = workloads.stored().unwrap();
        assert!(stored.metadata.finalizers.clone().unwrap_or_default().is_empty());
        let deleting = stored.condition(ConditionType::Deleting).unwrap();
        assert_eq!(deleting.status, ConditionStatus::True);
    }

    #[tokio::test(start_paused = true)]
    async fn first_sight_of_a_live_workload_gains_the_finalizer() {
        let backend = Arc::new(FakeBackend::new());
        let workloads = Arc::new(FakeWorkloadStore::with_workload(workload(
            "w1",
            1,
            "standard_nc6",
        )));
        let nodes = Arc::new(FakeNodeStore::with_nodes(vec![ready_node("existing")]));
        let ctx = Arc::new(context(backend, workloads.clone(), nodes));
        let w = Arc::new(workloads.stored().unwrap());

        reconcile(w, ctx).await.unwrap();

        let stored = workloads.stored().unwrap();
        assert!(stored
            .metadata
            .finalizers
            .unwrap_or_default()
            .contains(&WORKLOAD_FINALIZER.to_string()));
    }

    #[test]
    fn compute_events_map_back_to_their_workload() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_WORKLOAD_NAME.to_string(), "w1".to_string());
        labels.insert(LABEL_WORKLOAD_NAMESPACE.to_string(), "default".to_string());
        let pending = [ComputeCondition {
            type_: CONDITION_READY.to_string(),
            status: "False".to_string(),
            ..Default::default()
        }];
        let ready = [ComputeCondition {
            type_: CONDITION_READY.to_string(),
            status: "True".to_string(),
            ..Default::default()
        }];

        assert!(compute_event_maps_to_workload(None, &pending, false).is_none());
        assert!(compute_event_maps_to_workload(Some(&labels), &ready, false).is_none());

        let mapped = compute_event_maps_to_workload(Some(&labels), &pending, false).unwrap();
        assert_eq!(mapped.name, "w1");
        assert_eq!(mapped.namespace.as_deref(), Some("default"));

        // A ready object being deleted still re-enqueues its workload.
        assert!(compute_event_maps_to_workload(Some(&labels), &ready, true).is_some());
    }
}
