//! Deferred deletion of session sandboxes.
//!
//! A sandbox is deleted a fixed delay after its archive was delivered, late
//! enough to tolerate a retried download on a flaky connection. Each
//! schedule is an explicit timer task: re-scheduling a session replaces the
//! pending timer, and `cancel_removal` is the hook for extending a session's
//! lifetime on repeated access.
//!
//! Sandboxes whose archive is never downloaded are never swept here; the
//! deletion contract is tied to delivery. Bounding abandoned sessions is an
//! operator concern (tmpfs staging root or an external reaper).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    delay: Duration,
    pending: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl CleanupScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule recursive deletion of `sandbox` after the configured delay.
    ///
    /// A timer already pending for this session is replaced, not stacked.
    pub fn schedule_removal(&self, session_id: &str, sandbox: PathBuf) {
        let delay = self.delay;
        let pending = Arc::clone(&self.pending);
        let id = session_id.to_string();
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            remove_sandbox(&sandbox).await;
            // Bookkeeping only; the deletion itself has already run.
            if let Ok(mut map) = pending.lock() {
                map.remove(&task_id);
            }
        });

        if let Ok(mut map) = self.pending.lock() {
            if let Some(previous) = map.insert(id, handle) {
                previous.abort();
            }
        }
    }

    /// Abort a pending deletion. Returns whether a timer was pending.
    pub fn cancel_removal(&self, session_id: &str) -> bool {
        if let Ok(mut map) = self.pending.lock() {
            if let Some(handle) = map.remove(session_id) {
                handle.abort();
                tracing::debug!(session = session_id, "sandbox removal cancelled");
                return true;
            }
        }
        false
    }

    /// Number of deletions currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|map| map.len()).unwrap_or(0)
    }
}

/// Best-effort recursive delete. A sandbox that is already gone is fine.
async fn remove_sandbox(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            tracing::info!(path = %path.display(), "session sandbox removed");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove session sandbox");
        }
    }
}
