//! peerlab-state — metadata store for peerlab.
//!
//! Backed by [redb](https://docs.rs/redb), persists clusters, nodes,
//! scenarios, benchmarks, reports and experiments.
//!
//! # Architecture
//!
//! Every record is JSON-serialized into a `&[u8]` value column of its
//! entity's table. Node keys are `{cluster_id}/{node_id}`, so listing or
//! deleting a cluster's nodes is a prefix scan.
//!
//! Transactions are explicit: [`StateStore::begin_update`] hands out a
//! [`WriteTx`] carrying every mutating operation, [`StateStore::begin_view`]
//! a [`ReadTx`]. Reads are defined once on the [`ReadOps`] trait and work on
//! either handle or directly on the store. [`StateStore::update`] commits
//! only when its closure returns `Ok`; any error rolls back every write the
//! closure made.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ReadOps, ReadTx, StateStore, WriteTx};
pub use types::*;
