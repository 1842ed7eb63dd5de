//! Shared API type definitions
//!
//! This crate contains the GpuWorkload custom resource, the condition
//! vocabulary its status exposes, typed bindings for the Karpenter compute
//! objects the provisioner drives, and the static GPU SKU catalog.

mod compute;
pub mod sku;
mod workload;

pub use compute::ComputeCondition;
pub use compute::ComputeResources;
pub use compute::AKSNodeClass;
pub use compute::AKSNodeClassSpec;
pub use compute::EC2NodeClass;
pub use compute::EC2NodeClassSpec;
pub use compute::Machine;
pub use compute::MachineSpec;
pub use compute::MachineStatus;
pub use compute::MachineTemplateRef;
pub use compute::NodeClaim;
pub use compute::NodeClaimSpec;
pub use compute::NodeClaimStatus;
pub use compute::NodeClassReference;
pub use compute::Requirement;
pub use compute::SelectorTerm;
pub use compute::ANNOTATION_DO_NOT_DISRUPT;
pub use compute::CONDITION_READY;
pub use compute::LABEL_MACHINE_TYPE;
pub use compute::LABEL_NODE_POOL;
pub use compute::LABEL_PROVISIONER_NAME;
pub use compute::MACHINE_CONDITION_INITIALIZED;
pub use compute::MACHINE_CONDITION_LAUNCHED;
pub use compute::NODE_CLAIM_CONDITION_INITIALIZED;
pub use compute::NODE_CLAIM_CONDITION_LAUNCHED;
pub use compute::NODE_CLASS_NAME;
pub use compute::NODE_POOL_NAME;
pub use compute::PROVISIONER_NAME;
pub use compute::TAINT_EFFECT_NO_SCHEDULE;
pub use compute::TAINT_KEY_SKU;
pub use compute::TAINT_VALUE_GPU;
pub use workload::ConditionStatus;
pub use workload::ConditionType;
pub use workload::GpuWorkload;
pub use workload::GpuWorkloadSpec;
pub use workload::GpuWorkloadStatus;
pub use workload::WorkloadCondition;
pub use workload::WorkloadHandle;
pub use workload::LABEL_ACCELERATOR;
pub use workload::LABEL_ACCELERATOR_NVIDIA;
pub use workload::LABEL_ARCH;
pub use workload::LABEL_INSTANCE_TYPE;
pub use workload::LABEL_OS;
pub use workload::LABEL_WORKLOAD_NAME;
pub use workload::LABEL_WORKLOAD_NAMESPACE;
pub use workload::WORKLOAD_FINALIZER;
