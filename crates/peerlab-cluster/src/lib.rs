//! peerlab-cluster — provisioning and wiring of node fleets.
//!
//! # Architecture
//!
//! ```text
//!   ClusterManager ──► NodeProvider ──► NodeGroup (transient)
//!        │                                   │
//!        │◄──────── nodes persisted ─────────┘
//!        │
//!        └──► AgentConnector ──► NodeAgent (one per node)
//!                                    │
//!                       bootstrap: peer info fan-out,
//!                       then connect fan-out
//! ```
//!
//! The manager drives a cluster through `creating → connecting → created`
//! and `destroying → removed`, committing each step to the metadata store
//! before starting the next. Remote calls fan out concurrently with
//! first-error-cancels-siblings semantics.

pub mod agent;
pub mod bootstrap;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod lifecycle;
pub mod local;
pub mod ports;
pub mod provider;

pub use agent::{AgentConnector, HttpAgentConnector, NodeAgent, PeerInfo, TaskOutcome};
pub use lifecycle::{ClusterManager, HealthPolicy};
pub use local::LocalProvider;
pub use ports::PortPool;
pub use provider::{NodeGroup, NodeProvider};
