//! Object-store abstraction over the Kubernetes API.
//!
//! Every component talks to the cluster through these traits so tests can
//! substitute in-memory fakes and assert on call counts.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::ClusterResourceScope;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use api_types::GpuWorkload;

/// Errors surfaced by the object store, classified so callers can apply the
/// retry taxonomy: transient server errors are retried, not-found on a
/// concurrently deleted target is success, everything else surfaces.
#[derive(Debug, derive_more::Display)]
pub enum StoreError {
    #[display("object not found: {message}")]
    NotFound { message: String },
    #[display("object already exists: {message}")]
    AlreadyExists { message: String },
    #[display("write conflict: {message}")]
    Conflict { message: String },
    #[display("server throttled the request: {message}")]
    TooManyRequests { message: String },
    #[display("server unavailable: {message}")]
    Unavailable { message: String },
    #[display("server timeout: {message}")]
    ServerTimeout { message: String },
    #[display("api error (code {code}): {message}")]
    Api { code: u16, message: String },
    #[display("request failed: {message}")]
    Request { message: String },
    #[display("failed to encode object: {message}")]
    Encode { message: String },
}

impl core::error::Error for StoreError {}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Transient server-side failures worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. }
                | StoreError::ServerTimeout { .. }
                | StoreError::TooManyRequests { .. }
        )
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => StoreError::NotFound { message: ae.message },
                409 if ae.reason == "AlreadyExists" => {
                    StoreError::AlreadyExists { message: ae.message }
                }
                409 => StoreError::Conflict { message: ae.message },
                429 => StoreError::TooManyRequests { message: ae.message },
                503 => StoreError::Unavailable { message: ae.message },
                504 => StoreError::ServerTimeout { message: ae.message },
                code => StoreError::Api {
                    code,
                    message: ae.message,
                },
            },
            other => StoreError::Request {
                message: other.to_string(),
            },
        }
    }
}

/// Namespace/name pair identifying a workload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&GpuWorkload> for WorkloadKey {
    fn from(workload: &GpuWorkload) -> Self {
        Self {
            namespace: workload.metadata.namespace.clone().unwrap_or_default(),
            name: workload.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Get/List/Create/Delete over one cluster-scoped resource kind.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K, StoreError>;
    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError>;
    async fn create(&self, obj: &K) -> Result<K, StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Workload access with status-subresource writes. Updates go through the
/// API server's optimistic concurrency: the object's resourceVersion must
/// still match or the write is rejected with a conflict.
#[async_trait]
pub trait WorkloadStore<W>: Send + Sync {
    async fn get(&self, key: &WorkloadKey) -> Result<W, StoreError>;
    async fn update(&self, obj: &W) -> Result<W, StoreError>;
    async fn update_status(&self, obj: &W) -> Result<W, StoreError>;
}

/// Read and label cluster nodes.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>, StoreError>;
    async fn get(&self, name: &str) -> Result<Node, StoreError>;
    async fn set_label(&self, name: &str, key: &str, value: &str) -> Result<(), StoreError>;
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// The real store, backed by the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, name: &str) -> Result<K, StoreError> {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let api: Api<K> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkloadStore<GpuWorkload> for KubeStore {
    async fn get(&self, key: &WorkloadKey) -> Result<GpuWorkload, StoreError> {
        let api: Api<GpuWorkload> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get(&key.name).await?)
    }

    async fn update(&self, obj: &GpuWorkload) -> Result<GpuWorkload, StoreError> {
        let key = WorkloadKey::from(obj);
        let api: Api<GpuWorkload> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.replace(&key.name, &PostParams::default(), obj).await?)
    }

    async fn update_status(&self, obj: &GpuWorkload) -> Result<GpuWorkload, StoreError> {
        let key = WorkloadKey::from(obj);
        let api: Api<GpuWorkload> = Api::namespaced(self.client.clone(), &key.namespace);
        let data = serde_json::to_vec(obj).map_err(|e| StoreError::Encode {
            message: e.to_string(),
        })?;
        Ok(api
            .replace_status(&key.name, &PostParams::default(), data)
            .await?)
    }
}

#[async_trait]
impl NodeStore for KubeStore {
    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>, StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn get(&self, name: &str) -> Result<Node, StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn set_label(&self, name: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": {
                "labels": { key: value }
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selector_joins_pairs() {
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("b".to_string(), "2".to_string());
        assert_eq!(label_selector(&labels), "a=1,b=2");
    }

    #[test]
    fn transient_classification_covers_the_retry_taxonomy() {
        let transient = [
            StoreError::Unavailable { message: String::new() },
            StoreError::ServerTimeout { message: String::new() },
            StoreError::TooManyRequests { message: String::new() },
        ];
        for err in &transient {
            assert!(err.is_transient(), "{err} should be transient");
        }
        assert!(!StoreError::Conflict { message: String::new() }.is_transient());
        assert!(!StoreError::NotFound { message: String::new() }.is_transient());
    }
}
