//! Supervision of background runs.
//!
//! Every benchmark or experiment started through the API runs as a task
//! owned by the [`RunSupervisor`]. Each run gets a child of the
//! supervisor's root token, so it can be cancelled on its own or all at
//! once at shutdown. Runs are expected to record their own outcome when
//! cancelled; the supervisor only waits for them to return.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use peerlab_core::config::ShutdownMode;
use peerlab_core::{LabError, LabResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

struct Run {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Runs {
    active: HashMap<String, Run>,
    closed: bool,
}

impl Runs {
    fn prune(&mut self) {
        self.active.retain(|_, run| !run.handle.is_finished());
    }
}

#[derive(Default)]
pub struct RunSupervisor {
    root: CancellationToken,
    runs: Mutex<Runs>,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, Runs> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `work` under a fresh child token, tracked as `id`.
    pub fn spawn<W, F>(&self, id: impl Into<String>, work: W) -> LabResult<()>
    where
        W: FnOnce(CancellationToken) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let mut runs = self.runs();
        if runs.closed {
            return Err(LabError::Unavailable(format!(
                "not starting run {id}: shutting down"
            )));
        }
        runs.prune();
        if runs.active.contains_key(&id) {
            return Err(LabError::AlreadyExists(format!("run {id}")));
        }

        let cancel = self.root.child_token();
        let handle = tokio::spawn(work(cancel.clone()).in_current_span());
        debug!(run_id = %id, "run started");
        runs.active.insert(id, Run { cancel, handle });
        Ok(())
    }

    /// Cancel one in-flight run.
    pub fn cancel(&self, id: &str) -> LabResult<()> {
        let mut runs = self.runs();
        runs.prune();
        let run = runs
            .active
            .get(id)
            .ok_or_else(|| LabError::NotFound(format!("no running run {id}")))?;
        run.cancel.cancel();
        info!(run_id = %id, "run cancelled");
        Ok(())
    }

    /// True once shutdown has begun; no new runs are accepted.
    pub fn is_closed(&self) -> bool {
        self.runs().closed
    }

    pub fn is_running(&self, id: &str) -> bool {
        let mut runs = self.runs();
        runs.prune();
        runs.active.contains_key(id)
    }

    /// Ids of in-flight runs, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut runs = self.runs();
        runs.prune();
        let mut ids: Vec<String> = runs.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop accepting runs, then wait for the in-flight ones.
    ///
    /// `Drain` lets them finish; `Abandon` cancels them first and waits for
    /// them to record their outcome.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let active: Vec<(String, Run)> = {
            let mut runs = self.runs();
            runs.closed = true;
            runs.active.drain().collect()
        };
        info!(runs = active.len(), ?mode, "supervisor shutting down");
        if mode == ShutdownMode::Abandon {
            self.root.cancel();
        }

        for (id, run) in active {
            if let Err(e) = run.handle.await {
                error!(run_id = %id, error = %e, "run task failed");
            }
        }
        info!("supervisor stopped");
    }
}
