//! Scenario planning.
//!
//! Resolves every declared object to a content reference, then evaluates
//! each seed and benchmark query against the selected nodes and gives every
//! matched node a `get` task for the step's object. Node ids come out of the
//! query engine sorted, so the plan does not depend on the order the nodes
//! were listed in.

use std::collections::BTreeMap;
use std::sync::Arc;

use peerlab_core::{LabError, LabResult};
use peerlab_query::parse;
use peerlab_state::{Node, ObjectDefinition, Plan, ScenarioDefinition, Task, TaskKind};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Query text to the node ids it selected.
pub type QuerySelections = BTreeMap<String, Vec<String>>;

/// Maps a declared object to the reference nodes fetch it by.
pub trait ObjectResolver: Send + Sync {
    fn resolve(&self, name: &str, object: &ObjectDefinition) -> LabResult<String>;
}

/// Content-addresses an object by hashing its kind and source.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestResolver;

impl ObjectResolver for DigestResolver {
    fn resolve(&self, name: &str, object: &ObjectDefinition) -> LabResult<String> {
        if object.source.trim().is_empty() {
            return Err(LabError::InvalidArgument(format!(
                "object {name:?} has no source"
            )));
        }
        let mut hasher = Sha256::new();
        hasher.update(object.kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(object.source.as_bytes());
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }
}

pub struct Planner {
    resolver: Arc<dyn ObjectResolver>,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(Arc::new(DigestResolver))
    }
}

impl Planner {
    pub fn new(resolver: Arc<dyn ObjectResolver>) -> Self {
        Self { resolver }
    }

    /// Build the execution plan for `definition` over `nodes`.
    pub fn plan(
        &self,
        definition: &ScenarioDefinition,
        nodes: &[Node],
    ) -> LabResult<(Plan, QuerySelections)> {
        let mut plan = Plan::default();
        for (name, object) in &definition.objects {
            let reference = self.resolver.resolve(name, object)?;
            plan.objects.insert(name.clone(), reference);
        }

        let mut queries = QuerySelections::new();
        assign(
            "seed",
            &definition.seed,
            &plan.objects,
            nodes,
            &mut plan.seed,
            &mut queries,
        )?;
        assign(
            "benchmark",
            &definition.benchmark,
            &plan.objects,
            nodes,
            &mut plan.benchmark,
            &mut queries,
        )?;

        debug!(
            objects = plan.objects.len(),
            seed_nodes = plan.seed.len(),
            benchmark_nodes = plan.benchmark.len(),
            "scenario planned"
        );
        Ok((plan, queries))
    }
}

fn assign(
    phase: &str,
    steps: &BTreeMap<String, String>,
    objects: &BTreeMap<String, String>,
    nodes: &[Node],
    tasks: &mut BTreeMap<String, Vec<Task>>,
    queries: &mut QuerySelections,
) -> LabResult<()> {
    for (text, object) in steps {
        let query = parse(text).map_err(|e| {
            LabError::InvalidArgument(format!("{phase} query {text:?}: {e}"))
        })?;
        let reference = objects.get(object).ok_or_else(|| {
            LabError::InvalidArgument(format!(
                "{phase} query {text:?} names unknown object {object:?}"
            ))
        })?;

        let matched = query.execute(nodes);
        if matched.is_empty() {
            warn!(phase, query = %text, "query selected no nodes");
        }
        for node_id in matched.iter() {
            tasks
                .entry(node_id.to_string())
                .or_default()
                .push(Task::new(TaskKind::Get, reference.clone()));
        }
        queries.insert(text.clone(), matched.iter().map(str::to_string).collect());
    }
    Ok(())
}
