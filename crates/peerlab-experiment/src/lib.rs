//! peerlab-experiment — benchmarks and experiments end to end.
//!
//! # Architecture
//!
//! ```text
//! ExperimentCoordinator
//!   └── per trial (concurrent, first failure cancels the rest)
//!       ├── ClusterManager::create ── scenario record ── optional reset
//!       ├── BenchmarkPipeline: plan ─► running record ─► run ─► report + status
//!       └── ClusterManager::destroy (always, on a fresh token)
//!
//! RunSupervisor
//!   └── owns spawned benchmark and experiment runs, one child token each
//! ```

pub mod benchmark;
pub mod coordinator;
pub mod supervisor;

pub use benchmark::{BenchmarkPipeline, PreparedBenchmark};
pub use coordinator::{ExperimentCoordinator, TrialOptions};
pub use supervisor::RunSupervisor;
