// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::finder::FileFinder;
use super::handle::HarvesterHandle;
use crate::error::{BoxError, Error, Result};
use crate::harvester::{Directive, Harvester, HarvesterConfig};
use crate::publisher::Publisher;
use crate::registry::{FileId, Registry};

#[derive(Debug, Clone)]
pub struct ProspectorConfig {
    pub scan_interval: Duration,
    /// Consecutive discovery failures are logged as warnings for this long,
    /// then reported as an error
    pub max_scan_failure_duration: Duration,
    /// 0 means no limit
    pub max_harvesters: usize,
    /// Registry entries for files not harvested and not updated for this
    /// long are removed after each scan
    pub clean_inactive: Option<Duration>,
    /// How long finishing harvesters get at shutdown
    pub shutdown_grace: Duration,
    pub harvester: HarvesterConfig,
}

impl Default for ProspectorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            max_scan_failure_duration: Duration::from_secs(300),
            max_harvesters: 0,
            clean_inactive: None,
            shutdown_grace: Duration::from_secs(10),
            harvester: HarvesterConfig::default(),
        }
    }
}

impl ProspectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval.is_zero() {
            return Err(Error::Config("scan interval must be greater than zero".into()));
        }
        if let Some(clean) = self.clean_inactive {
            if clean <= self.scan_interval {
                return Err(Error::Config(format!(
                    "clean inactive {:?} must be longer than the scan interval {:?}",
                    clean, self.scan_interval
                )));
            }
        }
        self.harvester.validate()
    }
}

#[derive(Debug, Default)]
pub struct ProspectorStats {
    scans: AtomicU64,
    harvesters_started: AtomicU64,
    active_harvesters: AtomicUsize,
}

impl ProspectorStats {
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub fn harvesters_started(&self) -> u64 {
        self.harvesters_started.load(Ordering::Relaxed)
    }

    pub fn active_harvesters(&self) -> usize {
        self.active_harvesters.load(Ordering::Relaxed)
    }
}

/// Keeps one harvester per matched file identity.
pub struct Prospector<F: FileFinder> {
    config: ProspectorConfig,
    finder: Arc<F>,
    registry: Arc<Registry>,
    publisher: Publisher,
    harvesters: Vec<HarvesterHandle>,
    first_failure: Option<Instant>,
    failure_escalated: bool,
    stats: Arc<ProspectorStats>,
}

impl<F: FileFinder> Prospector<F> {
    pub fn new(
        config: ProspectorConfig,
        finder: F,
        registry: Arc<Registry>,
        publisher: Publisher,
    ) -> Self {
        Self {
            config,
            finder: Arc::new(finder),
            registry,
            publisher,
            harvesters: Vec::new(),
            first_failure: None,
            failure_escalated: false,
            stats: Arc::new(ProspectorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProspectorStats> {
        self.stats.clone()
    }

    /// Scan until cancelled. `first_scan` fires once the first scan has
    /// completed.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut first_scan: Option<oneshot::Sender<()>>,
    ) -> std::result::Result<(), BoxError> {
        let mut interval = tokio::time::interval(self.config.scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            scan_interval = ?self.config.scan_interval,
            max_harvesters = self.config.max_harvesters,
            "Prospector started"
        );

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if self.scan().await {
                if let Some(tx) = first_scan.take() {
                    let _ = tx.send(());
                }
            }
        }

        self.shutdown().await;
        info!("Prospector stopped");
        Ok(())
    }

    /// One scan cycle. Returns whether discovery succeeded. Failed
    /// discovery is retried on the next tick however long it lasts; past
    /// `max_scan_failure_duration` it is reported as an error once.
    pub(crate) async fn scan(&mut self) -> bool {
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        self.reap().await;

        let discovered = match self.discover().await {
            Ok(found) => {
                if self.first_failure.take().is_some() {
                    self.failure_escalated = false;
                    info!("File discovery recovered");
                }
                found
            }
            Err(e) => {
                let now = Instant::now();
                let first = *self.first_failure.get_or_insert(now);
                let failing_for = now.duration_since(first);
                if failing_for > self.config.max_scan_failure_duration && !self.failure_escalated {
                    self.failure_escalated = true;
                    error!(
                        error = %e,
                        failing_for = ?failing_for,
                        "File discovery keeps failing, existing harvesters continue"
                    );
                } else {
                    warn!(error = %e, failing_for = ?failing_for, "File discovery failed, will retry");
                }
                return false;
            }
        };

        self.reconcile(&discovered);
        self.resolve_collisions();
        self.clean_inactive().await;

        self.stats
            .active_harvesters
            .store(self.harvesters.len(), Ordering::Relaxed);
        true
    }

    /// Resolve patterns and stat every match on the blocking pool.
    async fn discover(&self) -> Result<Vec<(PathBuf, FileId)>> {
        let finder = self.finder.clone();
        tokio::task::spawn_blocking(move || {
            let paths = finder.find_files()?;
            let mut found = Vec::with_capacity(paths.len());
            for path in paths {
                match FileId::from_path(&path) {
                    Ok(id) => found.push((path, id)),
                    // Gone between matching and stat; the next scan decides.
                    Err(e) => debug!(path = ?path, error = %e, "Skipping file that cannot be stat'ed"),
                }
            }
            Ok(found)
        })
        .await?
    }

    async fn reap(&mut self) {
        let mut live = Vec::with_capacity(self.harvesters.len());
        for handle in self.harvesters.drain(..) {
            if handle.is_finished() {
                let status = handle.join().await;
                debug!(
                    path = ?status.path,
                    state = %status.state,
                    committed = status.committed_offset,
                    "Harvester exited"
                );
            } else {
                live.push(handle);
            }
        }
        self.harvesters = live;
    }

    fn reconcile(&mut self, discovered: &[(PathBuf, FileId)]) {
        let owned: HashSet<FileId> = self.harvesters.iter().map(|h| h.identity()).collect();
        let matched: HashSet<FileId> = discovered.iter().map(|(_, id)| *id).collect();

        let mut deferred = 0usize;
        let mut started = HashSet::new();
        for (path, id) in discovered {
            if owned.contains(id) || started.contains(id) {
                continue;
            }
            if self.config.max_harvesters > 0 && self.harvesters.len() >= self.config.max_harvesters {
                deferred += 1;
                continue;
            }
            self.start_harvester(path.clone(), *id);
            started.insert(*id);
        }
        if deferred > 0 {
            debug!(deferred, "Harvester limit reached, remaining files wait for a later scan");
        }

        for handle in &mut self.harvesters {
            if !matched.contains(&handle.identity()) {
                handle.direct(Directive::Drain);
            }
        }
    }

    fn start_harvester(&mut self, path: PathBuf, id: FileId) {
        let (harvester, control) = Harvester::new(
            &path,
            Some(id),
            self.config.harvester.clone(),
            self.registry.clone(),
            self.publisher.clone(),
        );
        let task = tokio::spawn(harvester.run());
        debug!(path = ?path, identity = %id, "Started harvester");

        self.stats.harvesters_started.fetch_add(1, Ordering::Relaxed);
        self.harvesters.push(HarvesterHandle::new(path, id, control, task));
    }

    fn resolve_collisions(&mut self) {
        let progress: Vec<(FileId, u64)> = self
            .harvesters
            .iter()
            .map(|h| (h.identity(), h.committed_offset()))
            .collect();

        for idx in losing_duplicates(&progress) {
            let handle = &mut self.harvesters[idx];
            warn!(
                path = ?handle.path(),
                identity = %handle.identity(),
                "Two harvesters read the same file, stopping the one with less progress"
            );
            handle.direct(Directive::Abort);
        }
    }

    async fn clean_inactive(&self) {
        let Some(max_age) = self.config.clean_inactive else {
            return;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return;
        };

        let owned: HashSet<FileId> = self.harvesters.iter().map(|h| h.identity()).collect();
        let registry = self.registry.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let cutoff = Utc::now() - max_age;
            registry.retain(|state| owned.contains(&state.identity) || state.updated_at >= cutoff)
        })
        .await;

        match removed {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!(removed = n, "Removed inactive registry entries"),
            Ok(Err(e)) => warn!(error = %e, "Failed to clean inactive registry entries"),
            Err(e) => warn!(error = %e, "Registry cleanup task failed"),
        }
    }

    /// Tell every harvester to finish, wait up to the grace period, then
    /// abort whatever is left.
    async fn shutdown(&mut self) {
        if self.harvesters.is_empty() {
            return;
        }
        info!(harvesters = self.harvesters.len(), "Finishing harvesters");

        for handle in &mut self.harvesters {
            handle.direct(Directive::Finish);
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        for handle in self.harvesters.drain(..) {
            let path = handle.path().to_path_buf();
            let abort = handle.abort_handle();
            if timeout_at(deadline, handle.join()).await.is_err() {
                warn!(path = ?path, "Harvester did not finish within the grace period, aborting");
                abort.abort();
            }
        }
        self.stats.active_harvesters.store(0, Ordering::Relaxed);
    }
}

/// Indices of harvesters that share an identity with one that has made
/// more progress. On a tie the earliest started harvester wins.
pub(crate) fn losing_duplicates(progress: &[(FileId, u64)]) -> Vec<usize> {
    let mut best: HashMap<FileId, usize> = HashMap::new();
    let mut losers = Vec::new();

    for (idx, (id, offset)) in progress.iter().enumerate() {
        match best.get(id).copied() {
            None => {
                best.insert(*id, idx);
            }
            Some(current) if *offset > progress[current].1 => {
                losers.push(current);
                best.insert(*id, idx);
            }
            Some(_) => losers.push(idx),
        }
    }

    losers.sort_unstable();
    losers
}
