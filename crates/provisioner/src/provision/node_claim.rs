//! Delegated backend: creates NodeClaims resolved by Karpenter through a
//! cloud-specific node class.

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
use api_types::EC2NodeClass;
use api_types::EC2NodeClassSpec;
use api_types::GpuWorkload;
use api_types::NodeClaim;
use api_types::NodeClaimSpec;
use api_types::NodeClassReference;
use api_types::Requirement;
use api_types::SelectorTerm;
use api_types::AKSNodeClass;
use api_types::AKSNodeClassSpec;
use api_types::ANNOTATION_DO_NOT_DISRUPT;
use api_types::CONDITION_READY;
use api_types::LABEL_INSTANCE_TYPE;
use api_types::LABEL_NODE_POOL;
use api_types::LABEL_OS;
use api_types::NODE_CLAIM_CONDITION_INITIALIZED;
use api_types::NODE_CLAIM_CONDITION_LAUNCHED;
use api_types::NODE_CLASS_NAME;
use api_types::NODE_POOL_NAME;
use api_types::TAINT_EFFECT_NO_SCHEDULE;
use api_types::TAINT_KEY_SKU;
use api_types::TAINT_VALUE_GPU;

use crate::infrastructure::retry::Backoff;
use crate::infrastructure::retry::DEFAULT_BACKOFF;
use crate::infrastructure::store::ObjectStore;
use crate::provision::compute_object_name;
use crate::provision::condition_is_true;
use crate::provision::failed_condition_message;
use crate::provision::CloudProvider;
use crate::provision::ComputeSnapshot;
use crate::provision::ProvisionError;
use crate::provision::ProvisionerBackend;
use crate::provision::INSTANCE_TYPES_UNAVAILABLE;

const KIND: &str = "nodeclaim";

const LABEL_AZURE_SKU_NAME: &str = "karpenter.azure.com/sku-name";
const LABEL_AWS_GPU_COUNT: &str = "karpenter.k8s.aws/instance-gpu-count";
const DISCOVERY_TAG: &str = "karpenter.sh/discovery";

pub struct NodeClaimBackend {
    claims: Arc<dyn ObjectStore<NodeClaim>>,
    aks_classes: Arc<dyn ObjectStore<AKSNodeClass>>,
    ec2_classes: Arc<dyn ObjectStore<EC2NodeClass>>,
    cloud: CloudProvider,
    cluster_name: Option<String>,
    settle_delay: Duration,
    backoff: Backoff,
}

impl NodeClaimBackend {
    pub fn new(
        claims: Arc<dyn ObjectStore<NodeClaim>>,
        aks_classes: Arc<dyn ObjectStore<AKSNodeClass>>,
        ec2_classes: Arc<dyn ObjectStore<EC2NodeClass>>,
        cloud: CloudProvider,
        cluster_name: Option<String>,
    ) -> Self {
        Self {
            claims,
            aks_classes,
            ec2_classes,
            cloud,
            cluster_name,
            settle_delay: Duration::from_secs(1),
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Creates the node class if absent; an existing class is left exactly
    /// as found.
    async fn ensure_node_class(&self) -> Result<(), Report<ProvisionError>> {
        match self.cloud {
            CloudProvider::Azure => {
                match self.aks_classes.get(NODE_CLASS_NAME).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_not_found() => {
                        info!(class = NODE_CLASS_NAME, "creating AKS node class");
                        match self.aks_classes.create(&aks_node_class()).await {
                            Ok(_) => Ok(()),
                            Err(err) if err.is_already_exists() => Ok(()),
                            Err(err) => Err(Report::new(err)
                                .change_context(ProvisionError::NodeClassFailed { cloud: "azure" })),
                        }
                    }
                    Err(err) => Err(Report::new(err)
                        .change_context(ProvisionError::NodeClassFailed { cloud: "azure" })),
                }
            }
            CloudProvider::Aws => {
                match self.ec2_classes.get(NODE_CLASS_NAME).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_not_found() => {
                        info!(class = NODE_CLASS_NAME, "creating EC2 node class");
                        let class = ec2_node_class(self.cluster_name.as_deref().unwrap_or_default());
                        match self.ec2_classes.create(&class).await {
                            Ok(_) => Ok(()),
                            Err(err) if err.is_already_exists() => Ok(()),
                            Err(err) => Err(Report::new(err)
                                .change_context(ProvisionError::NodeClassFailed { cloud: "aws" })),
                        }
                    }
                    Err(err) => Err(Report::new(err)
                        .change_context(ProvisionError::NodeClassFailed { cloud: "aws" })),
                }
            }
        }
    }

    fn manifest(&self, workload: &GpuWorkload, storage: &str) -> NodeClaim {
        let namespace = workload.metadata.namespace.clone().unwrap_or_default();
        let name = workload.metadata.name.clone().unwrap_or_default();
        let claim_name = compute_object_name(&namespace, &name);

        let mut labels: BTreeMap<String, String> = workload.ownership_labels();
        labels.insert(LABEL_NODE_POOL.to_string(), NODE_POOL_NAME.to_string());
        labels.extend(workload.spec.label_selector.clone());

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_DO_NOT_DISRUPT.to_string(), "true".to_string());

        let mut requirements = vec![
            Requirement::any_of(LABEL_NODE_POOL, vec![NODE_POOL_NAME.to_string()]),
            Requirement::any_of(
                LABEL_INSTANCE_TYPE,
                vec![workload.spec.instance_type.clone()],
            ),
            Requirement::any_of(LABEL_OS, vec!["linux".to_string()]),
        ];
        match self.cloud {
            CloudProvider::Azure => requirements.push(Requirement::any_of(
                LABEL_AZURE_SKU_NAME,
                vec![workload.spec.instance_type.clone()],
            )),
            CloudProvider::Aws => {
                requirements.push(Requirement::greater_than(LABEL_AWS_GPU_COUNT, "0"));
            }
        }

        let mut requests = BTreeMap::new();
        requests.insert(
            "ephemeral-storage".to_string(),
            Quantity(storage.to_string()),
        );

        let mut claim = NodeClaim::new(
            &claim_name,
            NodeClaimSpec {
                node_class_ref: Some(NodeClassReference {
                    name: NODE_CLASS_NAME.to_string(),
                    kind: Some(
                        match self.cloud {
                            CloudProvider::Azure => "AKSNodeClass",
                            CloudProvider::Aws => "EC2NodeClass",
                        }
                        .to_string(),
                    ),
                    api_version: None,
                }),
                requirements,
                taints: vec![Taint {
                    key: TAINT_KEY_SKU.to_string(),
                    value: Some(TAINT_VALUE_GPU.to_string()),
                    effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
                    ..Default::default()
                }],
                resources: ComputeResources { requests },
            },
        );
        claim.metadata.labels = Some(labels);
        claim.metadata.annotations = Some(annotations);
        claim
    }

    async fn try_create(
        &self,
        workload: &GpuWorkload,
        storage: &str,
    ) -> Result<ComputeSnapshot, Report<ProvisionError>> {
        self.ensure_node_class().await?;

        let manifest = self.manifest(workload, storage);
        let name = manifest.metadata.name.clone().unwrap_or_default();

        self.claims
            .create(&manifest)
            .await
            .map_err(Report::new)
            .change_context(ProvisionError::CreateFailed { kind: KIND })?;

        tokio::time::sleep(self.settle_delay).await;

        let created = self
            .claims
            .get(&name)
            .await
            .map_err(Report::new)
            .change_context(ProvisionError::Store { kind: KIND })?;
        let snapshot = node_claim_snapshot(&created);

        if snapshot.launch_failure.as_deref() == Some(INSTANCE_TYPES_UNAVAILABLE) {
            return Err(Report::new(ProvisionError::InstanceTypesUnavailable)
                .attach_printable(format!("nodeclaim {name} failed to launch")));
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl ProvisionerBackend for NodeClaimBackend {
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
                    info!(nodeclaim = %snapshot.name, "created nodeclaim");
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
                    warn!("nodeclaim creation failed, retrying: {report:?}");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.backoff.factor).min(self.backoff.max_delay);
                }
            }
        }
    }

    async fn get_compute(&self, name: &str) -> Result<ComputeSnapshot, Report<ProvisionError>> {
        let claim = self
            .claims
            .get(name)
            .await
            .map_err(Report::new)
            .change_context(ProvisionError::Store { kind: KIND })?;
        Ok(node_claim_snapshot(&claim))
    }

    async fn list_owned(
        &self,
        workload: &GpuWorkload,
    ) -> Result<Vec<ComputeSnapshot>, Report<ProvisionError>> {
        let claims = self
            .claims
            .list(&workload.ownership_labels())
            .await
            .map_err(Report::new)
            .change_context(ProvisionError::Store { kind: KIND })?;
        Ok(claims.iter().map(node_claim_snapshot).collect())
    }

    async fn delete_compute(&self, name: &str) -> Result<(), Report<ProvisionError>> {
        match self.claims.delete(name).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(Report::new(err).change_context(ProvisionError::Store { kind: KIND })),
        }
    }
}

fn aks_node_class() -> AKSNodeClass {
    let mut class = AKSNodeClass::new(
        NODE_CLASS_NAME,
        AKSNodeClassSpec {
            image_family: Some("Ubuntu2204".to_string()),
        },
    );
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "kubernetes.io/description".to_string(),
        "General purpose AKSNodeClass for running Ubuntu 22.04 nodes".to_string(),
    );
    class.metadata.annotations = Some(annotations);
    class
}

fn ec2_node_class(cluster_name: &str) -> EC2NodeClass {
    let mut discovery = BTreeMap::new();
    discovery.insert(DISCOVERY_TAG.to_string(), cluster_name.to_string());

    let mut class = EC2NodeClass::new(
        NODE_CLASS_NAME,
        EC2NodeClassSpec {
            ami_family: Some("AL2".to_string()),
            role: Some(format!("KarpenterNodeRole-{cluster_name}")),
            // Pods request ephemeral storage from the node's instance store.
            instance_store_policy: Some("RAID0".to_string()),
            subnet_selector_terms: vec![SelectorTerm {
                tags: discovery.clone(),
            }],
            security_group_selector_terms: vec![SelectorTerm { tags: discovery }],
        },
    );
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "kubernetes.io/description".to_string(),
        "General purpose EC2NodeClass for running Amazon Linux 2 nodes".to_string(),
    );
    class.metadata.annotations = Some(annotations);
    class
}

fn node_claim_snapshot(claim: &NodeClaim) -> ComputeSnapshot {
    let conditions = claim
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or(&[]);
    let instance_types = claim
        .spec
        .requirements
        .iter()
        .find(|r| r.key == LABEL_INSTANCE_TYPE)
        .map(|r| r.values.clone())
        .unwrap_or_default();

    ComputeSnapshot {
        name: claim.metadata.name.clone().unwrap_or_default(),
        instance_types,
        node_name: claim.status.as_ref().and_then(|s| s.node_name.clone()),
        launched: condition_is_true(conditions, NODE_CLAIM_CONDITION_LAUNCHED),
        initialized: condition_is_true(conditions, NODE_CLAIM_CONDITION_INITIALIZED),
        ready: condition_is_true(conditions, CONDITION_READY),
        deleting: claim.metadata.deletion_timestamp.is_some(),
        reported: !conditions.is_empty(),
        launch_failure: failed_condition_message(conditions, NODE_CLAIM_CONDITION_LAUNCHED),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use similar_asserts::assert_eq;

    use api_types::ComputeCondition;
    use api_types::NodeClaimStatus;

    use super::*;
    use crate::testing::workload_with_selector;
    use crate::testing::FakeObjects;

    struct Stores {
        claims: Arc<FakeObjects<NodeClaim>>,
        aks: Arc<FakeObjects<AKSNodeClass>>,
        ec2: Arc<FakeObjects<EC2NodeClass>>,
    }

    fn mark_ready(claim: &mut NodeClaim) {
        claim.status = Some(NodeClaimStatus {
            node_name: Some("aks-gpu-0".to_string()),
            conditions: vec![ComputeCondition {
                type_: CONDITION_READY.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }],
        });
    }

    fn backend(cloud: CloudProvider) -> (NodeClaimBackend, Stores) {
        let stores = Stores {
            claims: Arc::new(FakeObjects::<NodeClaim>::new().with_create_mutator(mark_ready)),
            aks: Arc::new(FakeObjects::<AKSNodeClass>::new()),
            ec2: Arc::new(FakeObjects::<EC2NodeClass>::new()),
        };
        let backend = NodeClaimBackend {
            claims: stores.claims.clone(),
            aks_classes: stores.aks.clone(),
            ec2_classes: stores.ec2.clone(),
            cloud,
            cluster_name: Some("prod".to_string()),
            settle_delay: Duration::from_millis(1),
            backoff: DEFAULT_BACKOFF,
        };
        (backend, stores)
    }

    #[tokio::test(start_paused = true)]
    async fn missing_node_class_is_created_exactly_once() {
        let (backend, stores) = backend(CloudProvider::Azure);
        let workload = workload_with_selector("w1", 1, "standard_nc6", &[]);

        backend.create_node(&workload, "0").await.unwrap();
        backend.create_node(&workload, "0").await.unwrap();

        assert_eq!(stores.aks.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(stores.aks.stored_names(), vec![NODE_CLASS_NAME.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_node_class_is_left_unmodified() {
        let (backend, stores) = backend(CloudProvider::Azure);
        let mut class = aks_node_class();
        class.spec.image_family = Some("Ubuntu2004".to_string());
        stores.aks.insert(class);

        let workload = workload_with_selector("w1", 1, "standard_nc6", &[]);
        backend.create_node(&workload, "0").await.unwrap();

        assert_eq!(stores.aks.create_calls.load(Ordering::SeqCst), 0);
        let kept = stores.aks.get_stored(NODE_CLASS_NAME).unwrap();
        assert_eq!(kept.spec.image_family.as_deref(), Some("Ubuntu2004"));
    }

    #[test]
    fn azure_manifest_pins_the_sku_label() {
        let (backend, _) = backend(CloudProvider::Azure);
        let workload = workload_with_selector("w1", 1, "standard_nc6", &[]);
        let claim = backend.manifest(&workload, "100Gi");

        let node_class_ref = claim.spec.node_class_ref.unwrap();
        assert_eq!(node_class_ref.kind.as_deref(), Some("AKSNodeClass"));

        let sku_req = claim
            .spec
            .requirements
            .iter()
            .find(|r| r.key == LABEL_AZURE_SKU_NAME)
            .unwrap();
        assert_eq!(sku_req.values, vec!["standard_nc6".to_string()]);
        assert_eq!(
            claim
                .spec
                .resources
                .requests
                .get("ephemeral-storage")
                .unwrap()
                .0,
            "100Gi"
        );
    }

    #[test]
    fn aws_manifest_requires_gpu_instances() {
        let (backend, _) = backend(CloudProvider::Aws);
        let workload = workload_with_selector("w1", 1, "p3.2xlarge", &[]);
        let claim = backend.manifest(&workload, "0");

        let node_class_ref = claim.spec.node_class_ref.unwrap();
        assert_eq!(node_class_ref.kind.as_deref(), Some("EC2NodeClass"));

        let gpu_req = claim
            .spec
            .requirements
            .iter()
            .find(|r| r.key == LABEL_AWS_GPU_COUNT)
            .unwrap();
        assert_eq!(gpu_req.operator, "Gt");

        let annotations = claim.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get(ANNOTATION_DO_NOT_DISRUPT).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn ec2_node_class_tags_both_selectors_with_the_cluster() {
        let class = ec2_node_class("prod");
        assert_eq!(class.spec.role.as_deref(), Some("KarpenterNodeRole-prod"));
        assert_eq!(
            class.spec.subnet_selector_terms[0].tags.get(DISCOVERY_TAG),
            Some(&"prod".to_string())
        );
        assert_eq!(
            class.spec.security_group_selector_terms[0]
                .tags
                .get(DISCOVERY_TAG),
            Some(&"prod".to_string())
        );
    }
}
