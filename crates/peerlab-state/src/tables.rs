//! redb table definitions for the peerlab metadata store.
//!
//! One table per entity type. Keys are entity ids except for nodes, which
//! are keyed `{cluster_id}/{node_id}` so a cluster's nodes form a prefix.

use redb::TableDefinition;

pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Clusters keyed by cluster id.
pub const CLUSTERS: Table = TableDefinition::new("clusters");

/// Nodes keyed by `{cluster_id}/{node_id}`.
pub const NODES: Table = TableDefinition::new("nodes");

/// Scenarios keyed by scenario id.
pub const SCENARIOS: Table = TableDefinition::new("scenarios");

/// Benchmarks keyed by benchmark id.
pub const BENCHMARKS: Table = TableDefinition::new("benchmarks");

/// Reports keyed by the id of the benchmark that produced them.
pub const REPORTS: Table = TableDefinition::new("reports");

/// Experiments keyed by experiment id.
pub const EXPERIMENTS: Table = TableDefinition::new("experiments");

pub(crate) const ALL: [Table; 6] = [CLUSTERS, NODES, SCENARIOS, BENCHMARKS, REPORTS, EXPERIMENTS];

/// Key of a node record.
pub fn node_key(cluster_id: &str, node_id: &str) -> String {
    format!("{cluster_id}/{node_id}")
}

/// Prefix shared by every node key of a cluster.
pub fn node_prefix(cluster_id: &str) -> String {
    format!("{cluster_id}/")
}
