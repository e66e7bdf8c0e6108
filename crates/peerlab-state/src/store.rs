//! StateStore — redb-backed metadata persistence for peerlab.
//!
//! Reads live on [`ReadOps`], implemented by [`ReadTx`], [`WriteTx`] and the
//! store itself (one implicit read transaction per call). Writes live only
//! on [`WriteTx`], so a call site that mutates state always names the
//! transaction it writes into.

use std::path::Path;
use std::sync::Arc;

use peerlab_core::epoch_secs;
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe metadata store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Start a read-write transaction. Nothing is visible to other readers
    /// until [`WriteTx::commit`]; dropping the handle aborts.
    pub fn begin_update(&self) -> StateResult<WriteTx> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Ok(WriteTx { txn })
    }

    /// Start a read-only snapshot transaction.
    pub fn begin_view(&self) -> StateResult<ReadTx> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(ReadTx { txn })
    }

    /// Run `f` in a read-write transaction, committing only if it returns
    /// `Ok`. An error rolls back every write `f` made.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&WriteTx) -> Result<T, E>,
        E: From<StateError>,
    {
        let tx = self.begin_update()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                warn!("transaction rolled back");
                if let Err(abort_err) = tx.abort() {
                    warn!(error = %abort_err, "abort failed");
                }
                Err(err)
            }
        }
    }

    /// Run `f` against one consistent read snapshot.
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTx) -> Result<T, E>,
        E: From<StateError>,
    {
        let tx = self.begin_view()?;
        f(&tx)
    }
}

/// Read-only transaction handle.
pub struct ReadTx {
    txn: ReadTransaction,
}

/// Read-write transaction handle.
pub struct WriteTx {
    txn: WriteTransaction,
}

// ── Reads ─────────────────────────────────────────────────────────

fn read_one<T>(table: &T, key: &str) -> StateResult<Option<Vec<u8>>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec()))
}

fn read_prefix<T>(table: &T, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push((key.value().to_string(), value.value().to_vec()));
        }
    }
    Ok(results)
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Deserialize(format!("{key}: {e}")))
}

fn fetch<T, R>(reader: &R, table: Table, key: &str, what: &str) -> StateResult<T>
where
    T: DeserializeOwned,
    R: ReadOps + ?Sized,
{
    let bytes = reader
        .get_raw(table, key)?
        .ok_or_else(|| StateError::NotFound(format!("{what} {key}")))?;
    decode(key, &bytes)
}

/// Decode every record under `prefix`. A malformed record fails the whole
/// listing rather than being skipped.
fn fetch_all<T, R>(reader: &R, table: Table, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadOps + ?Sized,
{
    reader
        .scan_raw(table, prefix)?
        .iter()
        .map(|(key, bytes)| decode(key, bytes))
        .collect()
}

/// Typed reads shared by every handle that can see the database.
pub trait ReadOps {
    fn get_raw(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// Every `(key, value)` whose key starts with `prefix`, in key order.
    fn scan_raw(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>>;

    fn get_cluster(&self, id: &str) -> StateResult<Cluster> {
        fetch(self, CLUSTERS, id, "cluster")
    }

    fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        fetch_all(self, CLUSTERS, "")
    }

    fn get_node(&self, cluster_id: &str, node_id: &str) -> StateResult<Node> {
        fetch(self, NODES, &node_key(cluster_id, node_id), "node")
    }

    /// Nodes of one cluster, ordered by node id.
    fn list_nodes(&self, cluster_id: &str) -> StateResult<Vec<Node>> {
        fetch_all(self, NODES, &node_prefix(cluster_id))
    }

    fn get_scenario(&self, id: &str) -> StateResult<Scenario> {
        fetch(self, SCENARIOS, id, "scenario")
    }

    fn list_scenarios(&self) -> StateResult<Vec<Scenario>> {
        fetch_all(self, SCENARIOS, "")
    }

    fn get_benchmark(&self, id: &str) -> StateResult<Benchmark> {
        fetch(self, BENCHMARKS, id, "benchmark")
    }

    fn list_benchmarks(&self) -> StateResult<Vec<Benchmark>> {
        fetch_all(self, BENCHMARKS, "")
    }

    fn get_report(&self, benchmark_id: &str) -> StateResult<Report> {
        fetch(self, REPORTS, benchmark_id, "report")
    }

    fn get_experiment(&self, id: &str) -> StateResult<Experiment> {
        fetch(self, EXPERIMENTS, id, "experiment")
    }

    fn list_experiments(&self) -> StateResult<Vec<Experiment>> {
        fetch_all(self, EXPERIMENTS, "")
    }
}

impl ReadOps for ReadTx {
    fn get_raw(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_one(&table, key)
    }

    fn scan_raw(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_prefix(&table, prefix)
    }
}

impl ReadOps for WriteTx {
    fn get_raw(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_one(&table, key)
    }

    fn scan_raw(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_prefix(&table, prefix)
    }
}

impl ReadOps for StateStore {
    fn get_raw(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.begin_view()?.get_raw(table, key)
    }

    fn scan_raw(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        self.begin_view()?.scan_raw(table, prefix)
    }
}

// ── Writes ────────────────────────────────────────────────────────

/// A labeled, timestamped record with its own table.
trait Record: Serialize + DeserializeOwned {
    const TABLE: Table;
    const KIND: &'static str;

    fn key(&self) -> String;
    fn labels_mut(&mut self) -> &mut Vec<String>;
    fn stamps_mut(&mut self) -> (&mut u64, &mut u64);
}

macro_rules! impl_record {
    ($ty:ty, $table:expr, $kind:literal) => {
        impl Record for $ty {
            const TABLE: Table = $table;
            const KIND: &'static str = $kind;

            fn key(&self) -> String {
                self.id.clone()
            }

            fn labels_mut(&mut self) -> &mut Vec<String> {
                &mut self.labels
            }

            fn stamps_mut(&mut self) -> (&mut u64, &mut u64) {
                (&mut self.created_at, &mut self.updated_at)
            }
        }
    };
}

impl_record!(Cluster, CLUSTERS, "cluster");
impl_record!(Scenario, SCENARIOS, "scenario");
impl_record!(Benchmark, BENCHMARKS, "benchmark");
impl_record!(Experiment, EXPERIMENTS, "experiment");

impl Record for Node {
    const TABLE: Table = NODES;
    const KIND: &'static str = "node";

    fn key(&self) -> String {
        node_key(&self.cluster_id, &self.id)
    }

    fn labels_mut(&mut self) -> &mut Vec<String> {
        &mut self.labels
    }

    fn stamps_mut(&mut self) -> (&mut u64, &mut u64) {
        (&mut self.created_at, &mut self.updated_at)
    }
}

/// Ids become key segments, so they must be non-empty and free of `/`.
fn validate_id(what: &str, id: &str) -> StateResult<()> {
    if id.is_empty() || id.contains('/') || id.trim() != id {
        return Err(StateError::InvalidKey(format!("{what} id {id:?}")));
    }
    Ok(())
}

impl WriteTx {
    /// Make every write of this transaction durable and visible.
    pub fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Transaction))
    }

    /// Discard every write of this transaction.
    pub fn abort(self) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Transaction))
    }

    /// Store `value` under `key` as-is, bypassing record encoding.
    #[cfg(any(test, feature = "testing"))]
    pub fn write_raw(&self, table: Table, key: &str, value: &[u8]) -> StateResult<()> {
        self.put_raw(table, key, value)
    }

    fn put_raw(&self, table: Table, key: &str, value: &[u8]) -> StateResult<()> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table.insert(key, value).map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove_raw(&self, table: Table, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    fn remove_prefix(&self, table: Table, prefix: &str) -> StateResult<usize> {
        let keys: Vec<String> = self
            .scan_raw(table, prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        for key in &keys {
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        Ok(keys.len())
    }

    fn put_record<T: Serialize>(&self, table: Table, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        self.put_raw(table, key, &value)
    }

    fn insert<R: Record>(&self, mut record: R) -> StateResult<R> {
        let key = record.key();
        if self.get_raw(R::TABLE, &key)?.is_some() {
            return Err(StateError::AlreadyExists(format!("{} {key}", R::KIND)));
        }
        let now = epoch_secs();
        let (created_at, updated_at) = record.stamps_mut();
        *created_at = now;
        *updated_at = now;
        normalize_labels(record.labels_mut());
        self.put_record(R::TABLE, &key, &record)?;
        debug!(kind = R::KIND, %key, "record created");
        Ok(record)
    }

    fn replace<R: Record>(&self, mut record: R) -> StateResult<R> {
        let key = record.key();
        let mut existing: R = fetch(self, R::TABLE, &key, R::KIND)?;
        let (created_at, updated_at) = record.stamps_mut();
        *created_at = *existing.stamps_mut().0;
        *updated_at = epoch_secs();
        normalize_labels(record.labels_mut());
        self.put_record(R::TABLE, &key, &record)?;
        Ok(record)
    }

    fn relabel<R: Record>(
        &self,
        keys: &[String],
        adds: &[String],
        removes: &[String],
    ) -> StateResult<Vec<R>> {
        keys.iter()
            .map(|key| {
                let mut record: R = fetch(self, R::TABLE, key, R::KIND)?;
                apply_labels(record.labels_mut(), adds, removes);
                self.replace(record)
            })
            .collect()
    }

    fn delete<R: Record>(&self, key: &str) -> StateResult<()> {
        if !self.remove_raw(R::TABLE, key)? {
            return Err(StateError::NotFound(format!("{} {key}", R::KIND)));
        }
        debug!(kind = R::KIND, %key, "record deleted");
        Ok(())
    }

    // ── Clusters ───────────────────────────────────────────────────

    pub fn create_cluster(&self, cluster: Cluster) -> StateResult<Cluster> {
        validate_id("cluster", &cluster.id)?;
        self.insert(cluster)
    }

    pub fn update_cluster(&self, cluster: Cluster) -> StateResult<Cluster> {
        self.replace(cluster)
    }

    /// Delete a cluster and every node recorded under it.
    pub fn delete_cluster(&self, id: &str) -> StateResult<()> {
        self.delete::<Cluster>(id)?;
        let nodes = self.remove_prefix(NODES, &node_prefix(id))?;
        debug!(cluster_id = %id, nodes, "cluster nodes removed");
        Ok(())
    }

    /// Relabel every listed cluster. Any missing id fails the whole call.
    pub fn label_clusters(
        &self,
        ids: &[String],
        adds: &[String],
        removes: &[String],
    ) -> StateResult<Vec<Cluster>> {
        self.relabel(ids, adds, removes)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Persist provider descriptors as nodes of an existing cluster.
    pub fn create_nodes(
        &self,
        cluster_id: &str,
        descriptors: &[NodeDescriptor],
    ) -> StateResult<Vec<Node>> {
        self.get_cluster(cluster_id)?;
        descriptors
            .iter()
            .map(|desc| {
                validate_id("node", &desc.id)?;
                self.insert(Node::from_descriptor(cluster_id, desc))
            })
            .collect()
    }

    pub fn update_node(&self, node: Node) -> StateResult<Node> {
        self.replace(node)
    }

    pub fn label_nodes(
        &self,
        cluster_id: &str,
        node_ids: &[String],
        adds: &[String],
        removes: &[String],
    ) -> StateResult<Vec<Node>> {
        let keys: Vec<String> = node_ids.iter().map(|id| node_key(cluster_id, id)).collect();
        self.relabel(&keys, adds, removes)
    }

    // ── Scenarios ──────────────────────────────────────────────────

    pub fn create_scenario(&self, scenario: Scenario) -> StateResult<Scenario> {
        validate_id("scenario", &scenario.id)?;
        self.insert(scenario)
    }

    pub fn delete_scenario(&self, id: &str) -> StateResult<()> {
        self.delete::<Scenario>(id)
    }

    pub fn label_scenarios(
        &self,
        ids: &[String],
        adds: &[String],
        removes: &[String],
    ) -> StateResult<Vec<Scenario>> {
        self.relabel(ids, adds, removes)
    }

    // ── Benchmarks ─────────────────────────────────────────────────

    pub fn create_benchmark(&self, benchmark: Benchmark) -> StateResult<Benchmark> {
        validate_id("benchmark", &benchmark.id)?;
        self.insert(benchmark)
    }

    pub fn update_benchmark(&self, benchmark: Benchmark) -> StateResult<Benchmark> {
        self.replace(benchmark)
    }

    /// Delete a benchmark and its report, if one was written.
    pub fn delete_benchmark(&self, id: &str) -> StateResult<()> {
        self.delete::<Benchmark>(id)?;
        self.remove_raw(REPORTS, id)?;
        Ok(())
    }

    pub fn label_benchmarks(
        &self,
        ids: &[String],
        adds: &[String],
        removes: &[String],
    ) -> StateResult<Vec<Benchmark>> {
        self.relabel(ids, adds, removes)
    }

    // ── Reports ────────────────────────────────────────────────────

    /// Store the one report of a benchmark.
    pub fn create_report(&self, benchmark_id: &str, mut report: Report) -> StateResult<Report> {
        self.get_benchmark(benchmark_id)?;
        if self.get_raw(REPORTS, benchmark_id)?.is_some() {
            return Err(StateError::AlreadyExists(format!("report {benchmark_id}")));
        }
        report.benchmark_id = benchmark_id.to_string();
        self.put_record(REPORTS, benchmark_id, &report)?;
        debug!(%benchmark_id, nodes = report.nodes.len(), "report stored");
        Ok(report)
    }

    // ── Experiments ────────────────────────────────────────────────

    pub fn create_experiment(&self, experiment: Experiment) -> StateResult<Experiment> {
        validate_id("experiment", &experiment.id)?;
        self.insert(experiment)
    }

    pub fn update_experiment(&self, experiment: Experiment) -> StateResult<Experiment> {
        self.replace(experiment)
    }

    pub fn delete_experiment(&self, id: &str) -> StateResult<()> {
        self.delete::<Experiment>(id)
    }

    pub fn label_experiments(
        &self,
        ids: &[String],
        adds: &[String],
        removes: &[String],
    ) -> StateResult<Vec<Experiment>> {
        self.relabel(ids, adds, removes)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use peerlab_core::{ErrorKind, LabError};

    fn definition(size: usize) -> ClusterDefinition {
        ClusterDefinition::Groups {
            groups: vec![ClusterGroup {
                size,
                instance_type: "t2.micro".to_string(),
                region: "us-west-2".to_string(),
                labels: vec![],
            }],
        }
    }

    fn descriptor(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: id.to_string(),
            address: "127.0.0.1".to_string(),
            agent_port: 7100,
            labels: vec!["region=us-west-2".to_string()],
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn store_with_cluster(id: &str) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .update(|tx| tx.create_cluster(Cluster::new(id, definition(2))))
            .unwrap();
        store
    }

    fn benchmark(id: &str, store: &StateStore) -> Benchmark {
        let cluster = store.get_cluster("c1").unwrap();
        let scenario = Scenario::new("s1", ScenarioDefinition::default());
        Benchmark::new(id, cluster, scenario, Plan::default())
    }

    // ── Clusters ───────────────────────────────────────────────────

    #[test]
    fn cluster_create_and_get_round_trip() {
        let store = store_with_cluster("c1");
        let cluster = store.get_cluster("c1").unwrap();

        assert_eq!(cluster.id, "c1");
        assert_eq!(cluster.definition, definition(2));
        assert_eq!(cluster.status, ClusterStatus::Creating);
        assert!(cluster.created_at > 0);
    }

    #[test]
    fn cluster_duplicate_create_is_rejected() {
        let store = store_with_cluster("c1");
        let err = store
            .update(|tx| tx.create_cluster(Cluster::new("c1", definition(1))))
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn cluster_get_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get_cluster("nope"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn cluster_update_keeps_created_at() {
        let store = store_with_cluster("c1");
        let mut cluster = store.get_cluster("c1").unwrap();
        let created_at = cluster.created_at;
        cluster.status = ClusterStatus::Connecting;
        cluster.created_at = 0;

        let updated = store.update(|tx| tx.update_cluster(cluster)).unwrap();
        assert_eq!(updated.created_at, created_at);
        assert_eq!(
            store.get_cluster("c1").unwrap().status,
            ClusterStatus::Connecting
        );
    }

    #[test]
    fn ids_with_separator_are_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .update(|tx| tx.create_cluster(Cluster::new("a/b", definition(1))))
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidKey(_)));
        assert_eq!(LabError::from(err).kind(), ErrorKind::InvalidArgument);
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn update_error_rolls_back_every_write() {
        let store = StateStore::open_in_memory().unwrap();
        let res: Result<(), StateError> = store.update(|tx| {
            tx.create_cluster(Cluster::new("c1", definition(1)))?;
            tx.create_nodes("c1", &[descriptor("n1")])?;
            Err(StateError::Write("injected".into()))
        });
        assert!(res.is_err());

        assert!(matches!(store.get_cluster("c1"), Err(StateError::NotFound(_))));
        assert!(store.list_nodes("c1").unwrap().is_empty());
    }

    #[test]
    fn explicit_handles_commit_and_abort() {
        let store = StateStore::open_in_memory().unwrap();

        let tx = store.begin_update().unwrap();
        tx.create_cluster(Cluster::new("kept", definition(1))).unwrap();
        tx.commit().unwrap();

        let tx = store.begin_update().unwrap();
        tx.create_cluster(Cluster::new("dropped", definition(1))).unwrap();
        // The write is visible inside its own transaction only.
        assert!(tx.get_cluster("dropped").is_ok());
        tx.abort().unwrap();

        assert!(store.get_cluster("kept").is_ok());
        assert!(store.get_cluster("dropped").is_err());
    }

    #[test]
    fn view_sees_a_stable_snapshot() {
        let store = store_with_cluster("c1");
        let view = store.begin_view().unwrap();

        store
            .update(|tx| tx.create_cluster(Cluster::new("c2", definition(1))))
            .unwrap();

        assert_eq!(view.list_clusters().unwrap().len(), 1);
        assert_eq!(store.list_clusters().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_node_creates_exactly_one_wins() {
        let store = store_with_cluster("c1");

        let results: Vec<StateResult<Vec<Node>>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let store = store.clone();
                    s.spawn(move || store.update(|tx| tx.create_nodes("c1", &[descriptor("n1")])))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exists = results
            .iter()
            .filter(|r| matches!(r, Err(StateError::AlreadyExists(_))))
            .count();
        assert_eq!((ok, exists), (1, 1));
        assert_eq!(store.list_nodes("c1").unwrap().len(), 1);
    }

    #[test]
    fn malformed_records_fail_listing() {
        let store = store_with_cluster("c1");
        let tx = store.begin_update().unwrap();
        tx.put_raw(CLUSTERS, "broken", b"{not json").unwrap();
        tx.commit().unwrap();

        let err = store.list_clusters().unwrap_err();
        assert!(matches!(err, StateError::Deserialize(_)));
        assert_eq!(LabError::from(err).kind(), ErrorKind::Internal);
    }

    // ── Nodes ──────────────────────────────────────────────────────

    #[test]
    fn nodes_require_an_existing_cluster() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .update(|tx| tx.create_nodes("ghost", &[descriptor("n1")]))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn node_labels_include_own_id() {
        let store = store_with_cluster("c1");
        store
            .update(|tx| tx.create_nodes("c1", &[descriptor("n1")]))
            .unwrap();

        let node = store.get_node("c1", "n1").unwrap();
        assert_eq!(node.labels, strings(&["n1", "region=us-west-2"]));
        assert_eq!(node.health, NodeHealth::Unknown);
        assert_eq!(node.agent_url(), "http://127.0.0.1:7100");
    }

    #[test]
    fn delete_cluster_cascades_to_its_nodes_only() {
        let store = store_with_cluster("c1");
        store
            .update(|tx| {
                tx.create_cluster(Cluster::new("c10", definition(1)))?;
                tx.create_nodes("c1", &[descriptor("n1"), descriptor("n2")])?;
                tx.create_nodes("c10", &[descriptor("n1")])
            })
            .unwrap();

        store.update(|tx| tx.delete_cluster("c1")).unwrap();

        assert!(store.list_nodes("c1").unwrap().is_empty());
        assert!(matches!(
            store.get_node("c1", "n1"),
            Err(StateError::NotFound(_))
        ));
        assert_eq!(store.list_nodes("c10").unwrap().len(), 1);
    }

    // ── Labels ─────────────────────────────────────────────────────

    #[test]
    fn labeling_twice_matches_labeling_once() {
        let store = store_with_cluster("c1");
        let ids = strings(&["c1"]);
        let adds = strings(&["team=p2p", "canary"]);
        let removes = strings(&["region=us-west-2"]);

        let once = store
            .update(|tx| tx.label_clusters(&ids, &adds, &removes))
            .unwrap();
        let twice = store
            .update(|tx| tx.label_clusters(&ids, &adds, &removes))
            .unwrap();

        assert_eq!(once[0].labels, twice[0].labels);
        assert_eq!(
            twice[0].labels,
            strings(&["c1", "canary", "instance_type=t2.micro", "team=p2p"])
        );
    }

    #[test]
    fn labeling_is_all_or_nothing() {
        let store = store_with_cluster("c1");
        let before = store.get_cluster("c1").unwrap().labels;

        let err = store
            .update(|tx| tx.label_clusters(&strings(&["c1", "missing"]), &strings(&["x"]), &[]))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        assert_eq!(store.get_cluster("c1").unwrap().labels, before);
    }

    // ── Benchmarks & reports ───────────────────────────────────────

    #[test]
    fn report_is_written_once() {
        let store = store_with_cluster("c1");
        let bench = benchmark("b1", &store);
        store.update(|tx| tx.create_benchmark(bench)).unwrap();

        let report = Report {
            queries: BTreeMap::from([("region=us-west-2".to_string(), strings(&["n1"]))]),
            ..Default::default()
        };
        let stored = store
            .update(|tx| tx.create_report("b1", report.clone()))
            .unwrap();
        assert_eq!(stored.benchmark_id, "b1");
        assert_eq!(store.get_report("b1").unwrap(), stored);

        let err = store.update(|tx| tx.create_report("b1", report)).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn delete_benchmark_removes_report() {
        let store = store_with_cluster("c1");
        let bench = benchmark("b1", &store);
        store
            .update(|tx| {
                tx.create_benchmark(bench)?;
                tx.create_report("b1", Report::default())
            })
            .unwrap();

        store.update(|tx| tx.delete_benchmark("b1")).unwrap();
        assert!(matches!(store.get_report("b1"), Err(StateError::NotFound(_))));
        assert!(matches!(
            store.update(|tx| tx.delete_benchmark("b1")),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn benchmark_snapshot_survives_cluster_changes() {
        let store = store_with_cluster("c1");
        let bench = benchmark("b1", &store);
        store.update(|tx| tx.create_benchmark(bench)).unwrap();

        store
            .update(|tx| tx.label_clusters(&strings(&["c1"]), &strings(&["later"]), &[]))
            .unwrap();

        let stored = store.get_benchmark("b1").unwrap();
        assert!(!stored.cluster.labels.contains(&"later".to_string()));
        assert_eq!(stored.labels, strings(&["b1", "c1", "s1"]));
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labd.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store
                .update(|tx| {
                    tx.create_experiment(Experiment::new("e1", ExperimentDefinition::default()))
                })
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let experiment = store.get_experiment("e1").unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Running);
        assert_eq!(store.list_experiments().unwrap().len(), 1);
    }
}
