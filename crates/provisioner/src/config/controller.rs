use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::provision::BackendKind;
use crate::provision::CloudProvider;

#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("the node-claim backend requires --cloud-provider")]
    MissingCloudProvider,
    #[display("the aws cloud provider requires --cluster-name")]
    MissingClusterName,
}

impl core::error::Error for ConfigError {}

#[derive(Args, Clone, Debug)]
pub struct ControllerArgs {
    #[arg(
        long,
        env = "KUBECONFIG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to an explicit kubeconfig; in-cluster config is used when omitted"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "PROVISIONER_BACKEND",
        value_enum,
        default_value = "machine",
        help = "Which compute-object backend creates new capacity"
    )]
    pub backend: BackendKind,

    #[arg(
        long,
        env = "CLOUD_PROVIDER",
        value_enum,
        help = "Cloud hosting the cluster; required by the node-claim backend"
    )]
    pub cloud_provider: Option<CloudProvider>,

    #[arg(
        long,
        env = "CLUSTER_NAME",
        help = "Cluster name used in the AWS node-class discovery tags"
    )]
    pub cluster_name: Option<String>,

    #[arg(
        long,
        default_value = "240",
        help = "Seconds to wait for a compute object to become ready"
    )]
    pub node_ready_timeout_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "How many distinct workloads may reconcile in parallel"
    )]
    pub max_concurrent_reconciles: u16,
}

/// Validated backend selection. Invalid flag combinations cannot reach the
/// constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendChoice {
    Machine,
    NodeClaim {
        cloud: CloudProvider,
        cluster_name: Option<String>,
    },
}

/// Runtime configuration derived from the CLI, threaded explicitly through
/// every constructor. Backend choice happens exactly once, here.
#[derive(Clone, Debug)]
pub struct Settings {
    pub backend: BackendChoice,
    pub node_ready_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub concurrency: u16,
}

impl ControllerArgs {
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let backend = match self.backend {
            BackendKind::Machine => BackendChoice::Machine,
            BackendKind::NodeClaim => {
                let cloud = self
                    .cloud_provider
                    .ok_or(ConfigError::MissingCloudProvider)?;
                if cloud == CloudProvider::Aws && self.cluster_name.is_none() {
                    return Err(ConfigError::MissingClusterName);
                }
                BackendChoice::NodeClaim {
                    cloud,
                    cluster_name: self.cluster_name.clone(),
                }
            }
        };
        Ok(Settings {
            backend,
            node_ready_timeout: Duration::from_secs(self.node_ready_timeout_secs),
            readiness_poll_interval: Duration::from_secs(1),
            concurrency: self.max_concurrent_reconciles,
        })
    }
}
