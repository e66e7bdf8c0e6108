//! peerlab-core — shared plumbing for the peerlab workspace.
//!
//! Holds the error taxonomy every orchestration layer speaks, the
//! first-error-cancels join used for fan-out over remote calls, and the
//! `labd` configuration file format.

pub mod config;
pub mod error;
pub mod join;

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

pub use config::LabdConfig;
pub use error::{ErrorKind, LabError, LabResult, ResultExt};
pub use join::{cancellable, ensure_active, try_join_all};

/// Boxed future alias used at trait seams that need dynamic dispatch.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Current Unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix timestamp in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Split a comma-joined form value, dropping empty segments.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_drops_empty_segments() {
        assert_eq!(split_list("a,,b, c ,"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
