//! Node-group provider gateway.
//!
//! A provider turns a [`ClusterDefinition`] into running nodes and tears
//! them down again. Calls may be slow and rate-limited; the core never
//! retries them, so any retry policy belongs to the provider.

use peerlab_core::{BoxFuture, LabResult};
use peerlab_state::{ClusterDefinition, ClusterGroup, Node, NodeDescriptor, normalize_labels};
use tokio_util::sync::CancellationToken;

/// Result of a provisioning call. Never persisted: its nodes are absorbed
/// into the metadata store immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroup {
    pub cluster_id: String,
    pub nodes: Vec<NodeDescriptor>,
}

impl NodeGroup {
    /// Rebuild a group from persisted nodes, for teardown.
    pub fn from_nodes(cluster_id: &str, nodes: &[Node]) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            nodes: nodes.iter().map(Node::descriptor).collect(),
        }
    }
}

/// Backend that creates and destroys physical nodes.
pub trait NodeProvider: Send + Sync {
    fn create_node_group<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        cluster_id: &'a str,
        definition: &'a ClusterDefinition,
    ) -> BoxFuture<'a, LabResult<NodeGroup>>;

    fn destroy_node_group<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        group: &'a NodeGroup,
    ) -> BoxFuture<'a, LabResult<()>>;
}

/// Labels every node of `group` carries: its shape plus the group's own.
pub fn group_node_labels(group: &ClusterGroup) -> Vec<String> {
    let mut labels = group.generate_labels();
    labels.extend(group.labels.iter().cloned());
    normalize_labels(&mut labels);
    labels
}
