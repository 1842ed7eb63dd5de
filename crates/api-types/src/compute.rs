//! Typed bindings for the Karpenter objects the provisioner creates.
//!
//! These CRDs are owned by the node-provisioning stack, not by us, so the
//! schemas are disabled: we only need enough of the shape to create, list
//! and inspect the objects.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use serde::Deserialize;
use serde::Serialize;

/// Provisioner pool every Machine is pinned to.
pub const PROVISIONER_NAME: &str = "default";

/// Node pool every NodeClaim is pinned to. The pool does not exist; pinning
/// claims to it keeps the autoscaler from scaling them up on its own.
pub const NODE_POOL_NAME: &str = "gpufleet";

/// Fixed name of the node class the delegated backend maintains.
pub const NODE_CLASS_NAME: &str = "gpufleet";

pub const LABEL_PROVISIONER_NAME: &str = "karpenter.sh/provisioner-name";
pub const LABEL_NODE_POOL: &str = "karpenter.sh/nodepool";
pub const LABEL_MACHINE_TYPE: &str = "gpufleet.sh/machine-type";
pub const ANNOTATION_DO_NOT_DISRUPT: &str = "karpenter.sh/do-not-disrupt";

pub const TAINT_KEY_SKU: &str = "sku";
pub const TAINT_VALUE_GPU: &str = "gpu";
pub const TAINT_EFFECT_NO_SCHEDULE: &str = "NoSchedule";

/// Condition milestones reported on compute objects.
pub const CONDITION_READY: &str = "Ready";
pub const MACHINE_CONDITION_LAUNCHED: &str = "MachineLaunched";
pub const MACHINE_CONDITION_INITIALIZED: &str = "MachineInitialized";
pub const NODE_CLAIM_CONDITION_LAUNCHED: &str = "Launched";
pub const NODE_CLAIM_CONDITION_INITIALIZED: &str = "Initialized";

/// One scheduling requirement row on a compute object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<i32>,
}

impl Requirement {
    pub fn any_of(key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            operator: "In".to_string(),
            values,
            min_values: None,
        }
    }

    pub fn greater_than(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: "Gt".to_string(),
            values: vec![value.into()],
            min_values: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeResources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Quantity>,
}

/// Condition entry as reported on Machine/NodeClaim status.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateRef {
    pub name: String,
}

/// Static provisioning request handled by the gpu-provisioner controller.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize)]
#[kube(
    group = "karpenter.sh",
    version = "v1alpha5",
    kind = "Machine",
    status = "MachineStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_template_ref: Option<MachineTemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub resources: ComputeResources,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ComputeCondition>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// Delegated provisioning request handled by Karpenter.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize)]
#[kube(
    group = "karpenter.sh",
    version = "v1beta1",
    kind = "NodeClaim",
    status = "NodeClaimStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_class_ref: Option<NodeClassReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub resources: ComputeResources,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ComputeCondition>,
}

/// Azure node template referenced by NodeClaims.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize)]
#[kube(
    group = "karpenter.azure.com",
    version = "v1alpha2",
    kind = "AKSNodeClass",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AKSNodeClassSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_family: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorTerm {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// AWS node template referenced by NodeClaims.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize)]
#[kube(
    group = "karpenter.k8s.aws",
    version = "v1beta1",
    kind = "EC2NodeClass",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct EC2NodeClassSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_store_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnet_selector_terms: Vec<SelectorTerm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_selector_terms: Vec<SelectorTerm>,
}
