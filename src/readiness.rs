// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{info, warn};

/// Whether the agent is up: the first scan is done and the pipeline takes
/// events. Cloned handles share the same state.
#[derive(Debug, Clone)]
pub struct Readiness {
    running: Arc<AtomicBool>,
    notify: Arc<watch::Sender<bool>>,
    ready_file: Option<PathBuf>,
}

impl Readiness {
    /// `ready_file` is created while running and removed when cleared.
    pub fn new(ready_file: Option<PathBuf>) -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(notify),
            ready_file,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }

    pub fn mark_running(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(path) = &self.ready_file {
            if let Err(e) = std::fs::write(path, std::process::id().to_string()) {
                warn!(path = ?path, error = %e, "Unable to write ready file");
            }
        }
        self.notify.send_replace(true);
        info!("efsbeat is running! Hit CTRL-C to stop it.");
    }

    pub fn clear(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(path) = &self.ready_file {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?path, error = %e, "Unable to remove ready file"),
            }
        }
        self.notify.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ready_file_follows_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ready");
        let readiness = Readiness::new(Some(path.clone()));
        let mut rx = readiness.subscribe();

        assert!(!readiness.is_running());
        assert!(!path.exists());

        readiness.mark_running();
        assert!(readiness.is_running());
        assert!(path.exists());
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());

        readiness.clear();
        assert!(!readiness.is_running());
        assert!(!path.exists());
        assert!(!*rx.borrow_and_update());
    }

    #[test]
    fn test_clones_share_state() {
        let readiness = Readiness::new(None);
        let other = readiness.clone();

        other.mark_running();
        assert!(readiness.is_running());

        // Repeated calls are no-ops
        readiness.mark_running();
        readiness.clear();
        readiness.clear();
        assert!(!other.is_running());
    }
}
