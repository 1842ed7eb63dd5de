//! Compute-capacity provisioning backends.
//!
//! A [`ProvisionerBackend`] turns a workload's deficit into concrete compute
//! objects. The static variant creates Machine objects handled by the
//! gpu-provisioner controller; the delegated variant creates NodeClaims
//! handled by Karpenter, backed by a cloud-specific node class.

mod in_flight;
mod machine;
mod node_claim;
mod readiness;

use async_trait::async_trait;
use chrono::Utc;
use error_stack::Report;
use sha2::Digest;
use sha2::Sha256;

use api_types::ComputeCondition;
use api_types::GpuWorkload;

pub use in_flight::CapacityAccountant;
pub use machine::MachineBackend;
pub use node_claim::NodeClaimBackend;
pub use readiness::ReadinessWaiter;

/// Permanent failure message reported by the provisioning stack when the
/// region has no capacity for the requested instance types. Never retried.
pub const INSTANCE_TYPES_UNAVAILABLE: &str =
    "all requested instance types were unavailable during launch";

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Create Machine objects directly.
    Machine,
    /// Create NodeClaims resolved through a cloud node class.
    NodeClaim,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum CloudProvider {
    Azure,
    Aws,
}

#[derive(Debug, derive_more::Display)]
pub enum ProvisionError {
    #[display("all requested instance types were unavailable during launch")]
    InstanceTypesUnavailable,
    #[display("instance type {instance_type} is not a supported GPU SKU")]
    UnsupportedInstanceType { instance_type: String },
    #[display("failed to create {kind} object")]
    CreateFailed { kind: &'static str },
    #[display("failed to ensure the {cloud} node class")]
    NodeClassFailed { cloud: &'static str },
    #[display("{kind} {name} was not ready within the deadline")]
    ReadyTimeout { kind: &'static str, name: String },
    #[display("{kind} {name} is ready but reports no node name")]
    NodeNameMissing { kind: &'static str, name: String },
    #[display("{kind} store request failed")]
    Store { kind: &'static str },
    #[display("provisioning interrupted by shutdown")]
    Interrupted,
}

impl core::error::Error for ProvisionError {}

/// True for failures that must surface immediately instead of being retried:
/// they represent exhausted or unknown capacity, not flaky infrastructure.
pub fn is_permanent(report: &Report<ProvisionError>) -> bool {
    matches!(
        report.current_context(),
        ProvisionError::InstanceTypesUnavailable
            | ProvisionError::UnsupportedInstanceType { .. }
    )
}

/// Point-in-time view of one compute object, independent of its kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComputeSnapshot {
    pub name: String,
    pub instance_types: Vec<String>,
    pub node_name: Option<String>,
    pub launched: bool,
    pub initialized: bool,
    pub ready: bool,
    pub deleting: bool,
    /// Whether the provisioning controller has reported any conditions yet.
    /// Freshly created objects can lag a few seconds behind.
    pub reported: bool,
    /// Message of a failed launch condition, if any.
    pub launch_failure: Option<String>,
}

impl ComputeSnapshot {
    pub fn matches_instance_type(&self, instance_type: &str) -> bool {
        self.instance_types.iter().any(|t| t == instance_type)
    }
}

/// Creates, inspects and deletes compute objects of one kind.
#[async_trait]
pub trait ProvisionerBackend: Send + Sync {
    /// Kind label used in conditions and log lines.
    fn kind(&self) -> &'static str;

    /// Creates one compute object for the workload and returns its snapshot.
    /// Retries transient failures with bounded backoff; the
    /// instance-unavailable signal is returned immediately.
    async fn create_node(
        &self,
        workload: &GpuWorkload,
        storage: &str,
    ) -> Result<ComputeSnapshot, Report<ProvisionError>>;

    async fn get_compute(&self, name: &str) -> Result<ComputeSnapshot, Report<ProvisionError>>;

    /// All compute objects carrying this workload's ownership labels.
    async fn list_owned(
        &self,
        workload: &GpuWorkload,
    ) -> Result<Vec<ComputeSnapshot>, Report<ProvisionError>>;

    /// Deletes a compute object; an already-deleted object is success.
    async fn delete_compute(&self, name: &str) -> Result<(), Report<ProvisionError>>;
}

/// Generates a compute-object name from the workload identity, the current
/// time and a process-local counter, so retries never collide with an
/// existing object.
pub(crate) fn compute_object_name(namespace: &str, name: &str) -> String {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_be_bytes(),
    );
    hasher.update(
        COUNTER
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .to_be_bytes(),
    );
    let digest = hex::encode(hasher.finalize());
    format!("gw{}", &digest[..9])
}

/// Condition helpers shared by both backends.
pub(crate) fn condition_is_true(conditions: &[ComputeCondition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == "True")
}

pub(crate) fn failed_condition_message(
    conditions: &[ComputeCondition],
    type_: &str,
) -> Option<String> {
    conditions
        .iter()
        .find(|c| c.type_ == type_ && c.status == "False")
        .and_then(|c| c.message.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_object_names_are_short_and_unique_per_call() {
        let a = compute_object_name("default", "w1");
        let b = compute_object_name("default", "w1");
        assert_eq!(a.len(), 11);
        assert!(a.starts_with("gw"));
        assert_ne!(a, b);
    }

    #[test]
    fn permanent_errors_are_the_capacity_ones() {
        assert!(is_permanent(&Report::new(
            ProvisionError::InstanceTypesUnavailable
        )));
        assert!(is_permanent(&Report::new(
            ProvisionError::UnsupportedInstanceType {
                instance_type: "foo".to_string(),
            }
        )));
        assert!(!is_permanent(&Report::new(ProvisionError::Store {
            kind: "machine",
        })));
    }
}
