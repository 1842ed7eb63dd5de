//! Static backend: creates Machine objects handled by the gpu-provisioner.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::info;
use tracing::warn;

use api_types::ComputeResources;
use api_types::GpuWorkload;
use api_types::Machine;
use api_types::MachineSpec;
use api_types::MachineTemplateRef;
use api_types::Requirement;
use api_types::CONDITION_READY;
use api_types::LABEL_ARCH;
use api_types::LABEL_INSTANCE_TYPE;
use api_types::LABEL_MACHINE_TYPE;
use api_types::LABEL_OS;
use api_types::LABEL_PROVISIONER_NAME;
use api_types::MACHINE_CONDITION_INITIALIZED;
use api_types::MACHINE_CONDITION_LAUNCHED;
use api_types::PROVISIONER_NAME;
use api_types::TAINT_EFFECT_NO_SCHEDULE;
use api_types::TAINT_KEY_SKU;
use api_types::TAINT_VALUE_GPU;

use crate::infrastructure::retry::Backoff;
use crate::infrastructure::retry::DEFAULT_BACKOFF;
use crate::infrastructure::store::ObjectStore;
use crate::provision::compute_object_name;
use crate::provision::condition_is_true;
use crate::provision::failed_condition_message;
use crate::provision::ComputeSnapshot;
use crate::provision::ProvisionError;
use crate::provision::ProvisionerBackend;
use crate::provision::INSTANCE_TYPES_UNAVAILABLE;

const KIND: &str = "machine";

pub struct MachineBackend {
    store: Arc<dyn ObjectStore<Machine>>,
    settle_delay: Duration,
    backoff: Backoff,
}

impl MachineBackend {
    pub fn new(store: Arc<dyn ObjectStore<Machine>>) -> Self {
        Self {
            store,
            settle_delay: Duration::from_secs(1),
            backoff: DEFAULT_BACKOFF,
        }
    }

    fn manifest(&self, workload: &GpuWorkload, storage: &str) -> Machine {
        let namespace = workload.metadata.namespace.clone().unwrap_or_default();
        let name = workload.metadata.name.clone().unwrap_or_default();
        let machine_name = compute_object_name(&namespace, &name);

        let mut labels: BTreeMap<String, String> = workload.ownership_labels();
        labels.insert(
            LABEL_PROVISIONER_NAME.to_string(),
            PROVISIONER_NAME.to_string(),
        );
        labels.extend(workload.spec.label_selector.clone());

        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(storage.to_string()));

        let mut machine = Machine::new(
            &machine_name,
            MachineSpec {
                machine_template_ref: Some(MachineTemplateRef {
                    name: machine_name.clone(),
                }),
                requirements: vec![
                    Requirement::any_of(
                        LABEL_INSTANCE_TYPE,
                        vec![workload.spec.instance_type.clone()],
                    ),
                    Requirement::any_of(
                        LABEL_PROVISIONER_NAME,
                        vec![PROVISIONER_NAME.to_string()],
                    ),
                    Requirement::any_of(LABEL_MACHINE_TYPE, vec![TAINT_VALUE_GPU.to_string()]),
                    Requirement::any_of(LABEL_ARCH, vec!["amd64".to_string()]),
                    Requirement::any_of(LABEL_OS, vec!["linux".to_string()]),
                ],
                taints: vec![Taint {
                    key: TAINT_KEY_SKU.to_string(),
                    value: Some(TAINT_VALUE_GPU.to_string()),
                    effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
                    ..Default::default()
                }],
                resources: ComputeResources { requests },
            },
        );
        machine.metadata.labels = Some(labels);
        machine
    }

    /// One create attempt: submit the manifest, give the provisioner a
    /// moment to react, then read the object back to catch an immediate
    /// launch failure.
    async fn try_create(
        &self,
        workload: &GpuWorkload,
        storage: &str,
    ) -> Result<ComputeSnapshot, Report<ProvisionError>> {
        let manifest = self.manifest(workload, storage);
        let name = manifest.metadata.name.clone().unwrap_or_default();

        self.store
            .create(&manifest)
            .await
            .map_err(Report::new)
            .change_context(ProvisionError::CreateFailed { kind: KIND })?;

        tokio::time::sleep(self.settle_delay).await;

        let created = self
            .store
            .get(&name)
            .await
            .map_err(Report::new)
            .change_context(ProvisionError::Store { kind: KIND })?;
        let snapshot = machine_snapshot(&created);

        if snapshot.launch_failure.as_deref() == Some(INSTANCE_TYPES_UNAVAILABLE) {
            return Err(Report::new(ProvisionError::InstanceTypesUnavailable)
                .attach_printable(format!("machine {name} failed to launch")));
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl ProvisionerBackend for MachineBackend {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn create_node(
        &self,
        workload: &GpuWorkload,
        storage: &str,
    ) -> Result<ComputeSnapshot, Report<ProvisionError>> {
        let mut delay = self.backoff.initial_delay;
        let mut attempt = 0;
        loop {
            match self.try_create(workload, storage).await {
                Ok(snapshot) => {
                    info!(machine = %snapshot.name, "created machine");
                    return Ok(snapshot);
                }
                Err(report) => {
                    if crate::provision::is_permanent(&report) {
                        return Err(report);
                    }
                    attempt += 1;
                    if attempt >= self.backoff.steps {
                        return Err(report);
                    }
                    warn!("machine creation failed, retrying: {report:?}");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.backoff.factor).min(self.backoff.max_delay);
                }
            }
        }
    }

    async fn get_compute(&self, name: &str) -> Result<ComputeSnapshot, Report<ProvisionError>> {
        let machine = self
            .store
            .get(name)
            .await
            .map_err(Report::new)
            .change_context(ProvisionError::Store { kind: KIND })?;
        Ok(machine_snapshot(&machine))
    }

    async fn list_owned(
        &self,
        workload: &GpuWorkload,
    ) -> Result<Vec<ComputeSnapshot>, Report<ProvisionError>> {
        let machines = self
            .store
            .list(&workload.ownership_labels())
            .await
            .map_err(Report::new)
            .change_context(ProvisionError::Store { kind: KIND })?;
        Ok(machines.iter().map(machine_snapshot).collect())
    }

    async fn delete_compute(&self, name: &str) -> Result<(), Report<ProvisionError>> {
        match self.store.delete(name).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(Report::new(err).change_context(ProvisionError::Store { kind: KIND })),
        }
    }
}

fn machine_snapshot(machine: &Machine) -> ComputeSnapshot {
    let conditions = machine
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or(&[]);
    let instance_types = machine
        .spec
        .requirements
        .iter()
        .find(|r| r.key == LABEL_INSTANCE_TYPE)
        .map(|r| r.values.clone())
        .unwrap_or_default();

    ComputeSnapshot {
        name: machine.metadata.name.clone().unwrap_or_default(),
        instance_types,
        node_name: machine.status.as_ref().and_then(|s| s.node_name.clone()),
        launched: condition_is_true(conditions, MACHINE_CONDITION_LAUNCHED),
        initialized: condition_is_true(conditions, MACHINE_CONDITION_INITIALIZED),
        ready: condition_is_true(conditions, CONDITION_READY),
        deleting: machine.metadata.deletion_timestamp.is_some(),
        reported: !conditions.is_empty(),
        launch_failure: failed_condition_message(conditions, MACHINE_CONDITION_LAUNCHED),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use similar_asserts::assert_eq;

    use api_types::ComputeCondition;
    use api_types::MachineStatus;
    use api_types::LABEL_WORKLOAD_NAME;

    use super::*;
    use crate::infrastructure::store::StoreError;
    use crate::testing::workload_with_selector;
    use crate::testing::FakeObjects;

    fn backend(store: Arc<FakeObjects<Machine>>) -> MachineBackend {
        MachineBackend {
            store,
            settle_delay: Duration::from_millis(1),
            backoff: DEFAULT_BACKOFF,
        }
    }

    fn mark_ready(machine: &mut Machine) {
        machine.status = Some(MachineStatus {
            node_name: Some(format!(
                "aks-{}",
                machine.metadata.name.clone().unwrap_or_default()
            )),
            conditions: vec![
                ComputeCondition {
                    type_: MACHINE_CONDITION_LAUNCHED.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                },
                ComputeCondition {
                    type_: CONDITION_READY.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                },
            ],
        });
    }

    fn mark_unavailable(machine: &mut Machine) {
        machine.status = Some(MachineStatus {
            node_name: None,
            conditions: vec![ComputeCondition {
                type_: MACHINE_CONDITION_LAUNCHED.to_string(),
                status: "False".to_string(),
                reason: None,
                message: Some(INSTANCE_TYPES_UNAVAILABLE.to_string()),
            }],
        });
    }

    #[test]
    fn manifest_carries_ownership_labels_requirements_and_taint() {
        let store = Arc::new(FakeObjects::<Machine>::new());
        let workload = workload_with_selector("w1", 2, "standard_nc6", &[("apps", "llm")]);
        let machine = backend(store).manifest(&workload, "50Gi");

        let labels = machine.metadata.labels.clone().unwrap();
        assert_eq!(labels.get(LABEL_WORKLOAD_NAME).unwrap(), "w1");
        assert_eq!(labels.get(LABEL_PROVISIONER_NAME).unwrap(), "default");
        assert_eq!(labels.get("apps").unwrap(), "llm");

        let instance_req = machine
            .spec
            .requirements
            .iter()
            .find(|r| r.key == LABEL_INSTANCE_TYPE)
            .unwrap();
        assert_eq!(instance_req.values, vec!["standard_nc6".to_string()]);

        assert_eq!(machine.spec.taints.len(), 1);
        assert_eq!(machine.spec.taints[0].key, "sku");
        assert_eq!(machine.spec.taints[0].effect, "NoSchedule");
        assert_eq!(
            machine.spec.resources.requests.get("storage").unwrap().0,
            "50Gi"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn instance_unavailable_is_never_retried() {
        let store = Arc::new(FakeObjects::<Machine>::new().with_create_mutator(mark_unavailable));
        let workload = workload_with_selector("w1", 1, "standard_nc6", &[]);

        let err = backend(store.clone())
            .create_node(&workload, "0")
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProvisionError::InstanceTypesUnavailable
        ));
        assert_eq!(store.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_create_failures_are_retried() {
        let store = Arc::new(
            FakeObjects::<Machine>::new()
                .with_create_mutator(mark_ready)
                .with_create_errors(vec![
                    StoreError::Unavailable {
                        message: "apiserver rolling".to_string(),
                    },
                    StoreError::ServerTimeout {
                        message: "slow".to_string(),
                    },
                ]),
        );
        let workload = workload_with_selector("w1", 1, "standard_nc6", &[]);

        let snapshot = backend(store.clone())
            .create_node(&workload, "0")
            .await
            .unwrap();
        assert!(snapshot.ready);
        assert_eq!(store.create_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn name_collision_retries_with_a_different_name() {
        let store = Arc::new(
            FakeObjects::<Machine>::new()
                .with_create_mutator(mark_ready)
                .with_create_errors(vec![StoreError::AlreadyExists {
                    message: "machine exists".to_string(),
                }]),
        );
        let workload = workload_with_selector("w1", 1, "standard_nc6", &[]);

        let snapshot = backend(store.clone())
            .create_node(&workload, "0")
            .await
            .unwrap();
        assert_eq!(store.create_calls.load(Ordering::SeqCst), 2);
        // The stored object is the second attempt, under a fresh name.
        assert_eq!(store.stored_names(), vec![snapshot.name.clone()]);
    }

    #[tokio::test]
    async fn delete_tolerates_already_deleted_objects() {
        let store = Arc::new(FakeObjects::<Machine>::new());
        backend(store).delete_compute("gw000000000").await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_reflects_initialization_milestones() {
        let store = Arc::new(FakeObjects::<Machine>::new());
        let workload = workload_with_selector("w1", 1, "standard_nc6", &[]);
        let mut machine = backend(store.clone()).manifest(&workload, "0");
        machine.status = Some(MachineStatus {
            node_name: None,
            conditions: vec![ComputeCondition {
                type_: MACHINE_CONDITION_INITIALIZED.to_string(),
                status: "False".to_string(),
                ..Default::default()
            }],
        });
        store.insert(machine.clone());

        let snapshot = backend(store)
            .get_compute(&machine.metadata.name.unwrap())
            .await
            .unwrap();
        assert!(snapshot.reported);
        assert!(!snapshot.initialized);
        assert!(!snapshot.ready);
        assert_eq!(snapshot.instance_types, vec!["standard_nc6".to_string()]);
    }
}
