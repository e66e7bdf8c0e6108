//! peerlab-scenario — turns a scenario into node work and the work into a report.
//!
//! # Architecture
//!
//! ```text
//! ScenarioDefinition + selected nodes
//!   └── Planner ──► Plan (objects, seed tasks, benchmark tasks) + query selections
//!         └── run() ──► Execution (per-node traces, start/end, trace id)
//!               └── aggregate() ──► Report
//! ```
//!
//! Planning and aggregation are pure. Running talks to node agents: the seed
//! phase is all-or-nothing, the benchmark phase keeps whatever traces the
//! nodes produced even when some of them fail.

pub mod plan;
pub mod report;
pub mod run;

pub use plan::{DigestResolver, ObjectResolver, Planner, QuerySelections};
pub use report::{aborted, aggregate, trace_link};
pub use run::{Execution, run};
