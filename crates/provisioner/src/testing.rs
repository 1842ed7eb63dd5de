//! Hand-rolled fixtures shared by the unit tests: in-memory stores and a
//! fake provisioning backend, all counting their calls so idempotence laws
//! can be asserted against exact write counts.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::NodeCondition;
use k8s_openapi::api::core::v1::NodeStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;

use api_types::GpuWorkload;
use api_types::GpuWorkloadSpec;
use api_types::WORKLOAD_FINALIZER;

use crate::infrastructure::store::NodeStore;
use crate::infrastructure::store::ObjectStore;
use crate::infrastructure::store::StoreError;
use crate::infrastructure::store::WorkloadKey;
use crate::infrastructure::store::WorkloadStore;
use crate::provision::ComputeSnapshot;
use crate::provision::ProvisionError;
use crate::provision::ProvisionerBackend;

pub(crate) fn workload(name: &str, count: i32, instance_type: &str) -> GpuWorkload {
    let mut w = GpuWorkload::new(
        name,
        GpuWorkloadSpec {
            count,
            instance_type: instance_type.to_string(),
            label_selector: BTreeMap::new(),
            preferred_nodes: Vec::new(),
            storage: None,
        },
    );
    w.metadata.namespace = Some("default".to_string());
    w.metadata.generation = Some(1);
    w
}

pub(crate) fn workload_with_selector(
    name: &str,
    count: i32,
    instance_type: &str,
    selector: &[(&str, &str)],
) -> GpuWorkload {
    let mut w = workload(name, count, instance_type);
    w.spec.label_selector = selector
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    w
}

pub(crate) fn deleting_workload(name: &str) -> GpuWorkload {
    let mut w = workload(name, 1, "standard_nc6");
    w.metadata.deletion_timestamp = Some(Time(Utc::now()));
    w.metadata.finalizers = Some(vec![WORKLOAD_FINALIZER.to_string()]);
    w
}

pub(crate) fn node_with_labels(
    name: &str,
    labels: BTreeMap<String, String>,
    ready: bool,
) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node.metadata.labels = Some(labels);
    if ready {
        node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }
    node
}

pub(crate) fn ready_node(name: &str) -> Node {
    node_with_labels(name, BTreeMap::new(), true)
}

pub(crate) fn snapshot(name: &str, ready: bool) -> ComputeSnapshot {
    ComputeSnapshot {
        name: name.to_string(),
        instance_types: vec!["standard_nc6".to_string()],
        node_name: None,
        launched: ready,
        initialized: ready,
        ready,
        deleting: false,
        reported: true,
        launch_failure: None,
    }
}

pub(crate) fn snapshot_with(
    name: &str,
    instance_type: &str,
    initialized: bool,
    reported: bool,
) -> ComputeSnapshot {
    ComputeSnapshot {
        name: name.to_string(),
        instance_types: vec![instance_type.to_string()],
        node_name: None,
        launched: reported,
        initialized,
        ready: false,
        deleting: false,
        reported,
        launch_failure: None,
    }
}

fn labels_match(obj_labels: Option<&BTreeMap<String, String>>, wanted: &BTreeMap<String, String>) -> bool {
    let obj_labels = match obj_labels {
        Some(labels) => labels,
        None => return wanted.is_empty(),
    };
    wanted.iter().all(|(k, v)| obj_labels.get(k) == Some(v))
}

/// In-memory cluster-scoped object store with per-call error injection.
pub(crate) struct FakeObjects<K> {
    objects: Mutex<BTreeMap<String, K>>,
    create_errors: Mutex<VecDeque<StoreError>>,
    create_mutator: Option<fn(&mut K)>,
    pub(crate) create_calls: AtomicUsize,
}

impl<K: Resource + Clone> FakeObjects<K> {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            create_errors: Mutex::new(VecDeque::new()),
            create_mutator: None,
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Runs `mutator` on every created object before it is stored, standing
    /// in for the provisioning controller reacting to the create.
    pub(crate) fn with_create_mutator(mut self, mutator: fn(&mut K)) -> Self {
        self.create_mutator = Some(mutator);
        self
    }

    /// Fails the next create calls with the given errors, in order.
    pub(crate) fn with_create_errors(self, errors: Vec<StoreError>) -> Self {
        *self.create_errors.lock().unwrap() = errors.into();
        self
    }

    pub(crate) fn insert(&self, obj: K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.objects.lock().unwrap().insert(name, obj);
    }

    pub(crate) fn stored_names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn get_stored(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl<K> ObjectStore<K> for FakeObjects<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                message: format!("{name} not found"),
            })
    }

    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|obj| labels_match(obj.meta().labels.as_ref(), labels))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut created = obj.clone();
        if let Some(mutator) = self.create_mutator {
            mutator(&mut created);
        }
        self.insert(created.clone());
        Ok(created)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self.objects.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                message: format!("{name} not found"),
            }),
        }
    }
}

/// In-memory node store; `set_label` mutates the stored node like the merge
/// patch would.
pub(crate) struct FakeNodeStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    pub(crate) set_label_calls: AtomicUsize,
}

impl FakeNodeStore {
    pub(crate) fn with_nodes(nodes: Vec<Node>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|n| (n.metadata.name.clone().unwrap_or_default(), n))
            .collect();
        Self {
            nodes: Mutex::new(nodes),
            set_label_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NodeStore for FakeNodeStore {
    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|node| labels_match(node.metadata.labels.as_ref(), labels))
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Node, StoreError> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                message: format!("node {name} not found"),
            })
    }

    async fn set_label(&self, name: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_label_calls.fetch_add(1, Ordering::SeqCst);
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(name).ok_or_else(|| StoreError::NotFound {
            message: format!("node {name} not found"),
        })?;
        node.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Holds at most one workload, which is all the reconciler tests need.
pub(crate) struct FakeWorkloadStore {
    workload: Mutex<Option<GpuWorkload>>,
    status_update_errors: Mutex<VecDeque<StoreError>>,
    pub(crate) update_calls: AtomicUsize,
    pub(crate) update_status_calls: AtomicUsize,
}

impl FakeWorkloadStore {
    pub(crate) fn empty() -> Self {
        Self {
            workload: Mutex::new(None),
            status_update_errors: Mutex::new(VecDeque::new()),
            update_calls: AtomicUsize::new(0),
            update_status_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_workload(workload: GpuWorkload) -> Self {
        let store = Self::empty();
        *store.workload.lock().unwrap() = Some(workload);
        store
    }

    pub(crate) fn stored(&self) -> Option<GpuWorkload> {
        self.workload.lock().unwrap().clone()
    }

    pub(crate) fn fail_next_status_updates(&self, errors: Vec<StoreError>) {
        *self.status_update_errors.lock().unwrap() = errors.into();
    }
}

#[async_trait]
impl WorkloadStore<GpuWorkload> for FakeWorkloadStore {
    async fn get(&self, key: &WorkloadKey) -> Result<GpuWorkload, StoreError> {
        self.workload
            .lock()
            .unwrap()
            .as_ref()
            .filter(|w| WorkloadKey::from(*w) == *key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                message: format!("workload {key} not found"),
            })
    }

    async fn update(&self, obj: &GpuWorkload) -> Result<GpuWorkload, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        *self.workload.lock().unwrap() = Some(obj.clone());
        Ok(obj.clone())
    }

    async fn update_status(&self, obj: &GpuWorkload) -> Result<GpuWorkload, StoreError> {
        self.update_status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.status_update_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        *self.workload.lock().unwrap() = Some(obj.clone());
        Ok(obj.clone())
    }
}

const FAKE_KIND: &str = "fake";

/// Fake provisioning backend over plain snapshots. Objects become ready
/// after a configurable number of fetches, mimicking the provisioner
/// catching up in the background.
pub(crate) struct FakeBackend {
    snapshots: Mutex<BTreeMap<String, ComputeSnapshot>>,
    ready_thresholds: Mutex<BTreeMap<String, usize>>,
    gets_by_name: Mutex<BTreeMap<String, usize>>,
    fail_deletes: AtomicBool,
    keep_after_delete: AtomicBool,
    created: AtomicUsize,
    pub(crate) get_calls: AtomicUsize,
    pub(crate) create_calls: AtomicUsize,
    pub(crate) delete_calls: AtomicUsize,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self {
            snapshots: Mutex::new(BTreeMap::new()),
            ready_thresholds: Mutex::new(BTreeMap::new()),
            gets_by_name: Mutex::new(BTreeMap::new()),
            fail_deletes: AtomicBool::new(false),
            keep_after_delete: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn insert(&self, snapshot: ComputeSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.name.clone(), snapshot);
    }

    /// The named object reports ready on its n-th fetch.
    pub(crate) fn ready_after_gets(&self, name: &str, gets: usize) {
        self.ready_thresholds
            .lock()
            .unwrap()
            .insert(name.to_string(), gets);
    }

    pub(crate) fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    /// Deletes succeed but the objects linger, like dependents with their
    /// own finalizers still terminating.
    pub(crate) fn keep_objects_after_delete(&self) {
        self.keep_after_delete.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProvisionerBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        FAKE_KIND
    }

    async fn create_node(
        &self,
        workload: &GpuWorkload,
        _storage: &str,
    ) -> Result<ComputeSnapshot, Report<ProvisionError>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let created = ComputeSnapshot {
            name: format!("gw-fake-{n}"),
            instance_types: vec![workload.spec.instance_type.clone()],
            node_name: None,
            launched: true,
            initialized: false,
            ready: false,
            deleting: false,
            reported: true,
            launch_failure: None,
        };
        self.ready_after_gets(&created.name, 1);
        self.insert(created.clone());
        Ok(created)
    }

    async fn get_compute(&self, name: &str) -> Result<ComputeSnapshot, Report<ProvisionError>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let mut snapshots = self.snapshots.lock().unwrap();
        let snapshot = snapshots
            .get_mut(name)
            .ok_or_else(|| Report::new(ProvisionError::Store { kind: FAKE_KIND }))?;

        let mut gets = self.gets_by_name.lock().unwrap();
        let seen = gets.entry(name.to_string()).or_insert(0);
        *seen += 1;
        if let Some(threshold) = self.ready_thresholds.lock().unwrap().get(name) {
            if *seen >= *threshold {
                snapshot.ready = true;
                snapshot.initialized = true;
                if snapshot.node_name.is_none() {
                    snapshot.node_name = Some(format!("node-{name}"));
                }
            }
        }
        Ok(snapshot.clone())
    }

    async fn list_owned(
        &self,
        _workload: &GpuWorkload,
    ) -> Result<Vec<ComputeSnapshot>, Report<ProvisionError>> {
        Ok(self.snapshots.lock().unwrap().values().cloned().collect())
    }

    async fn delete_compute(&self, name: &str) -> Result<(), Report<ProvisionError>> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Report::new(ProvisionError::Store { kind: FAKE_KIND }));
        }
        if !self.keep_after_delete.load(Ordering::SeqCst) {
            self.snapshots.lock().unwrap().remove(name);
        }
        Ok(())
    }
}
