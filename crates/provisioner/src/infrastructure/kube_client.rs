use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::infrastructure::store::StoreError;

/// Builds the Kubernetes client, preferring an explicit kubeconfig path and
/// falling back to in-cluster or `~/.kube/config` resolution.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<StoreError>> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            let kubeconfig =
                Kubeconfig::read_from(&kubeconfig_path).change_context(StoreError::Request {
                    message: format!(
                        "failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(StoreError::Request {
                    message: format!(
                        "failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(StoreError::Request {
                message: "failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        None => Client::try_default()
            .await
            .change_context(StoreError::Request {
                message: "failed to create Kubernetes client".to_string(),
            })?,
    };
    Ok(client)
}
