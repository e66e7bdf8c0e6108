//! Fan-out with first-error-cancels-siblings semantics.
//!
//! Every future runs as its own task under a child of the caller's
//! [`CancellationToken`]. The first failure cancels that child token so
//! outstanding siblings observe the abort, the remaining tasks are
//! aborted, and the failure is returned. Cancelling the caller's token
//! cancels every sibling the same way.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LabError, LabResult};

/// Fail fast with [`LabError::Cancelled`] once `cancel` has fired.
pub fn ensure_active(cancel: &CancellationToken) -> LabResult<()> {
    if cancel.is_cancelled() {
        return Err(LabError::Cancelled);
    }
    Ok(())
}

/// Race `fut` against `cancel`; cancellation wins ties.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> LabResult<T>
where
    F: Future<Output = LabResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LabError::Cancelled),
        res = fut => res,
    }
}

/// Run `futures` concurrently and collect their outputs in input order.
///
/// Returns the first error encountered. Outputs are only returned when
/// every future succeeded.
pub async fn try_join_all<T, F, I>(cancel: &CancellationToken, futures: I) -> LabResult<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = LabResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let group = cancel.child_token();
    let mut set = JoinSet::new();
    let mut count = 0usize;

    for (index, fut) in futures.into_iter().enumerate() {
        let token = group.clone();
        set.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => (index, Err(LabError::Cancelled)),
                res = fut => (index, res),
            }
        });
        count += 1;
    }

    let mut results: Vec<Option<T>> = (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let err = match joined {
            Ok((index, Ok(value))) => {
                results[index] = Some(value);
                continue;
            }
            Ok((index, Err(err))) => {
                debug!(index, error = %err, "sibling failed, cancelling group");
                err
            }
            Err(join_err) => LabError::Internal(format!("task failed: {join_err}")),
        };
        group.cancel();
        set.abort_all();
        return Err(err);
    }

    Ok(results.into_iter().flatten().collect())
}
