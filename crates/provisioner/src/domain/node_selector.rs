//! Filters and ranks cluster nodes against a workload's requirements.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::info;

use api_types::GpuWorkload;
use api_types::LABEL_INSTANCE_TYPE;
use api_types::LABEL_MACHINE_TYPE;
use api_types::LABEL_NODE_POOL;

use crate::infrastructure::store::NodeStore;
use crate::infrastructure::store::StoreError;

pub struct NodeSelector {
    nodes: Arc<dyn NodeStore>,
}

impl NodeSelector {
    pub fn new(nodes: Arc<dyn NodeStore>) -> Self {
        Self { nodes }
    }

    /// Returns every node that currently satisfies the workload: label
    /// selector matched, not being deleted, instance type compatible, and
    /// reporting Ready. Read-only.
    pub async fn qualified_nodes(
        &self,
        workload: &GpuWorkload,
    ) -> Result<Vec<Node>, StoreError> {
        let listed = self.nodes.list(&workload.spec.label_selector).await?;
        if listed.is_empty() {
            info!(
                workload = %workload.name_any(),
                "no current nodes match the workload label selector"
            );
        }

        Ok(listed
            .into_iter()
            .filter(|node| node.metadata.deletion_timestamp.is_none())
            .filter(|node| has_instance_type(node, &workload.spec.instance_type))
            .filter(is_node_ready)
            .collect())
    }
}

/// A node with no instance-type label is accepted; a mismatching label
/// disqualifies it.
fn has_instance_type(node: &Node, instance_type: &str) -> bool {
    match node.labels().get(LABEL_INSTANCE_TYPE) {
        Some(label) => label == instance_type,
        None => true,
    }
}

fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Nodes created through a provisioner pool are more likely to be empty.
fn provisioner_created(node: &Node) -> bool {
    let labels = node.labels();
    labels.contains_key(LABEL_MACHINE_TYPE) || labels.contains_key(LABEL_NODE_POOL)
}

/// Picks up to `count` nodes from the qualified set with a deterministic
/// ranking: preferred nodes, then previously selected nodes, then
/// provisioner-created nodes, then everything else by name. Repeated calls
/// over unchanged inputs never churn the selection.
pub fn select_nodes(
    mut qualified: Vec<Node>,
    preferred: &[String],
    previous: &[String],
    count: usize,
) -> Vec<Node> {
    qualified.sort_by(|a, b| {
        let a_name = a.name_any();
        let b_name = b.name_any();
        let rank = |name: &String, node: &Node| {
            (
                !preferred.contains(name),
                !previous.contains(name),
                !provisioner_created(node),
            )
        };
        rank(&a_name, a)
            .cmp(&rank(&b_name, b))
            .then_with(|| a_name.cmp(&b_name))
    });
    qualified.truncate(count);
    qualified
}
