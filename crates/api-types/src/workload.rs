use std::collections::BTreeMap;

use chrono::SecondsFormat;
use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Label carrying the owning workload's name on compute objects and nodes.
pub const LABEL_WORKLOAD_NAME: &str = "gpufleet.sh/workload-name";

/// Label carrying the owning workload's namespace on compute objects.
pub const LABEL_WORKLOAD_NAMESPACE: &str = "gpufleet.sh/workload-namespace";

/// Finalizer guarding compute-object cleanup on workload deletion.
pub const WORKLOAD_FINALIZER: &str = "workload.finalizer.gpufleet.sh";

/// Well-known node label holding the instance type.
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

/// Well-known node label holding the CPU architecture.
pub const LABEL_ARCH: &str = "kubernetes.io/arch";

/// Well-known node label holding the operating system.
pub const LABEL_OS: &str = "kubernetes.io/os";

/// Label stamped on nodes once GPU capacity has materialized, so the device
/// plugin daemonset schedules onto them.
pub const LABEL_ACCELERATOR: &str = "accelerator";
pub const LABEL_ACCELERATOR_NVIDIA: &str = "nvidia";

/// A declarative request for GPU compute capacity.
///
/// The spec is owned by the user; the controller only writes `status`.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gpufleet.sh",
    version = "v1alpha1",
    kind = "GpuWorkload",
    namespaced,
    status = "GpuWorkloadStatus",
    shortname = "gwl",
    printcolumn = r#"{"name":"InstanceType","type":"string","jsonPath":".spec.instanceType"}"#,
    printcolumn = r#"{"name":"Count","type":"integer","jsonPath":".spec.count"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GpuWorkloadSpec {
    /// Target number of worker nodes backing this workload.
    pub count: i32,

    /// Cloud instance type every worker node must have.
    pub instance_type: String,

    /// Labels a node must carry to qualify for this workload.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_selector: BTreeMap<String, String>,

    /// Node names the user would like used first, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_nodes: Vec<String>,

    /// Per-node ephemeral storage request for newly provisioned nodes,
    /// as a Kubernetes quantity string. "0" keeps the platform default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GpuWorkloadStatus {
    /// Names of the cluster nodes currently backing the workload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_nodes: Vec<String>,

    /// Observed conditions, one entry per condition type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkloadCondition>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition types exposed to downstream consumers.
///
/// The `Workload*` pair is written by the manifest-generation collaborators
/// that consume this status; the provisioning core writes the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    ResourceProvisioningStarted,
    ResourceProvisioned,
    WorkloadProvisioningStarted,
    WorkloadProvisioned,
    Ready,
    Failed,
    Deleting,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::ResourceProvisioningStarted => "ResourceProvisioningStarted",
            ConditionType::ResourceProvisioned => "ResourceProvisioned",
            ConditionType::WorkloadProvisioningStarted => "WorkloadProvisioningStarted",
            ConditionType::WorkloadProvisioned => "WorkloadProvisioned",
            ConditionType::Ready => "Ready",
            ConditionType::Failed => "Failed",
            ConditionType::Deleting => "Deleting",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl WorkloadCondition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            type_: type_.as_str().to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    /// True when status, reason and message all match; transition time and
    /// generation are ignored so unchanged conditions stay untouched.
    pub fn same_outcome(&self, other: &WorkloadCondition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Capability surface the status reconciler needs from a workload kind.
///
/// Implementing this per kind keeps the reconciler free of type switches.
pub trait WorkloadHandle {
    fn conditions(&self) -> &[WorkloadCondition];
    fn conditions_mut(&mut self) -> &mut Vec<WorkloadCondition>;
    fn worker_nodes(&self) -> &[String];
    fn set_worker_nodes(&mut self, nodes: Vec<String>);

    fn condition(&self, type_: ConditionType) -> Option<&WorkloadCondition> {
        self.conditions().iter().find(|c| c.type_ == type_.as_str())
    }

    /// Replaces the condition of the same type or appends a new one, keeping
    /// the set deduplicated by type.
    fn upsert_condition(&mut self, condition: WorkloadCondition) {
        let conditions = self.conditions_mut();
        match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => conditions.push(condition),
        }
    }
}

impl WorkloadHandle for GpuWorkload {
    fn conditions(&self) -> &[WorkloadCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<WorkloadCondition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    fn worker_nodes(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.worker_nodes.as_slice())
            .unwrap_or(&[])
    }

    fn set_worker_nodes(&mut self, nodes: Vec<String>) {
        self.status.get_or_insert_with(Default::default).worker_nodes = nodes;
    }
}

impl GpuWorkload {
    /// The label pair tying compute objects back to this workload. This is
    /// the only discovery mechanism for owned objects.
    pub fn ownership_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_WORKLOAD_NAME.to_string(),
            self.metadata.name.clone().unwrap_or_default(),
        );
        labels.insert(
            LABEL_WORKLOAD_NAMESPACE.to_string(),
            self.metadata.namespace.clone().unwrap_or_default(),
        );
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(name: &str) -> GpuWorkload {
        let mut w = GpuWorkload::new(
            name,
            GpuWorkloadSpec {
                count: 1,
                instance_type: "standard_nc6".to_string(),
                label_selector: BTreeMap::new(),
                preferred_nodes: Vec::new(),
                storage: None,
            },
        );
        w.metadata.namespace = Some("default".to_string());
        w
    }

    #[test]
    fn upsert_condition_deduplicates_by_type() {
        let mut w = workload("w1");
        w.upsert_condition(WorkloadCondition::new(
            ConditionType::Ready,
            ConditionStatus::False,
            "Pending",
            "not yet",
            Some(1),
        ));
        w.upsert_condition(WorkloadCondition::new(
            ConditionType::Ready,
            ConditionStatus::True,
            "Provisioned",
            "all good",
            Some(2),
        ));
        w.upsert_condition(WorkloadCondition::new(
            ConditionType::Failed,
            ConditionStatus::False,
            "NoFailure",
            "",
            Some(2),
        ));

        assert_eq!(w.conditions().len(), 2);
        let ready = w.condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.observed_generation, Some(2));
    }

    #[test]
    fn same_outcome_ignores_transition_time() {
        let a = WorkloadCondition::new(
            ConditionType::Ready,
            ConditionStatus::True,
            "Provisioned",
            "all good",
            Some(1),
        );
        let mut b = a.clone();
        b.last_transition_time = Some("2001-01-01T00:00:00Z".to_string());
        b.observed_generation = Some(7);
        assert!(a.same_outcome(&b));

        let mut c = a.clone();
        c.reason = "Other".to_string();
        assert!(!a.same_outcome(&c));
    }

    #[test]
    fn ownership_labels_carry_name_and_namespace() {
        let labels = workload("w1").ownership_labels();
        assert_eq!(labels.get(LABEL_WORKLOAD_NAME).unwrap(), "w1");
        assert_eq!(labels.get(LABEL_WORKLOAD_NAMESPACE).unwrap(), "default");
    }

    #[test]
    fn spec_round_trips_through_camel_case_json() {
        let w = workload("w1");
        let json = serde_json::to_value(&w.spec).unwrap();
        assert!(json.get("instanceType").is_some());
        let back: GpuWorkloadSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back.instance_type, "standard_nc6");
    }
}
