// SPDX-License-Identifier: Apache-2.0

//! Periodic storage usage reports for configured paths, with the size EFS
//! would bill for them next to the plain byte count.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use glob::{Pattern, glob};
use serde_json::json;
use tokio::select;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{BoxError, Error, Result};
use crate::event::{Event, EventKind};
use crate::publisher::{Publisher, Rejected};

/// EFS rounds every object up to this many bytes.
pub const EFS_BLOCK_BYTES: u64 = 4 * 1024;
/// Per-file metadata charge.
pub const EFS_METADATA_BYTES: u64 = 2 * 1024;

#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub paths: Vec<String>,
    pub period: Duration,
    /// Only report matches that are directories
    pub dir_only: bool,
}

impl UsageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(Error::Config("usage period must be greater than zero".into()));
        }
        for pattern in &self.paths {
            Pattern::new(pattern)
                .map_err(|e| Error::InvalidGlob(format!("{}: {}", pattern, e)))?;
        }
        Ok(())
    }
}

/// Sizes of one walked tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathUsage {
    pub real: u64,
    pub metered: u64,
    /// Entries that could not be read and were left out
    pub errors: u64,
}

impl PathUsage {
    fn add(&mut self, size: u64, is_dir: bool) {
        self.real += size;
        self.metered += metered_size(size, is_dir);
    }
}

/// What EFS bills for one object of `size` bytes.
pub fn metered_size(size: u64, is_dir: bool) -> u64 {
    let size = if size == 0 { EFS_METADATA_BYTES } else { size };
    let rounded = size.div_ceil(EFS_BLOCK_BYTES) * EFS_BLOCK_BYTES;
    if is_dir {
        rounded
    } else {
        rounded + EFS_METADATA_BYTES
    }
}

/// Walk `root` without following symlinks below it. The root itself
/// counts. Entries that cannot be read are logged and skipped; only an
/// unreadable root is an error.
pub fn measure(root: &Path) -> io::Result<PathUsage> {
    let mut usage = PathUsage::default();
    let mut seen_root = false;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if !seen_root => return Err(e.into()),
            Err(e) => {
                warn!(path = ?e.path(), error = %e, "Unable to read entry");
                usage.errors += 1;
                continue;
            }
        };
        seen_root = true;

        match entry.metadata() {
            Ok(metadata) => usage.add(metadata.len(), metadata.is_dir()),
            Err(e) if entry.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!(path = ?entry.path(), error = %e, "Unable to stat entry");
                usage.errors += 1;
            }
        }
    }

    Ok(usage)
}

/// Publishes one usage event per matched path every period.
pub struct UsageReporter {
    config: UsageConfig,
    publisher: Publisher,
}

impl UsageReporter {
    pub fn new(config: UsageConfig, publisher: Publisher) -> Self {
        Self { config, publisher }
    }

    pub async fn run(self, cancel: CancellationToken) -> std::result::Result<(), BoxError> {
        let mut ticker = interval_at(Instant::now() + self.config.period, self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            paths = ?self.config.paths,
            period = ?self.config.period,
            "Usage reporter started"
        );

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let config = self.config.clone();
            let reports = tokio::task::spawn_blocking(move || collect(&config)).await?;

            for (path, usage) in reports {
                let payload = json!({
                    "path": path.to_string_lossy(),
                    "size.real": usage.real,
                    "size.efsmetered": usage.metered,
                });
                let event = Event::unrouted(
                    EventKind::Usage,
                    &path,
                    Bytes::from(serde_json::to_vec(&payload)?),
                );

                select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("Usage reporter stopped");
                        return Ok(());
                    }
                    res = self.publisher.publish(event) => {
                        if let Err(Rejected::Closed) = res {
                            debug!("Pipeline closed, usage reporter exiting");
                            return Ok(());
                        }
                    }
                }
            }
        }

        info!("Usage reporter stopped");
        Ok(())
    }
}

/// Resolve every pattern and measure each match.
fn collect(config: &UsageConfig) -> Vec<(PathBuf, PathUsage)> {
    let mut reports = Vec::new();

    for pattern in &config.paths {
        let matches = match glob(pattern) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Unable to resolve usage path");
                continue;
            }
        };

        for entry in matches {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "Unable to resolve usage path");
                    continue;
                }
            };

            let is_dir = match fs::metadata(&path) {
                Ok(metadata) => metadata.is_dir(),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Unable to stat usage path");
                    continue;
                }
            };
            if config.dir_only && !is_dir {
                continue;
            }

            info!(path = ?path, "Calculating path size");
            match measure(&path) {
                Ok(usage) => {
                    debug!(
                        path = ?path,
                        real = usage.real,
                        metered = usage.metered,
                        errors = usage.errors,
                        "Path size calculated"
                    );
                    reports.push((path, usage));
                }
                Err(e) => warn!(path = ?path, error = %e, "Unable to calculate path size"),
            }
        }
    }

    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{Pipeline, PipelineConfig};
    use crate::testing::{RecordingSink, wait_for};
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn test_metered_size_rounding() {
        assert_eq!(metered_size(0, true), 4096);
        assert_eq!(metered_size(0, false), 4096 + 2048);
        assert_eq!(metered_size(1, false), 4096 + 2048);
        assert_eq!(metered_size(4096, false), 4096 + 2048);
        assert_eq!(metered_size(4097, false), 8192 + 2048);
        assert_eq!(metered_size(4097, true), 8192);
    }

    #[test]
    fn test_measure_walks_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        let sub = root.join("sub");
        fs::create_dir_all(&sub).unwrap();
        fs::write(root.join("a.bin"), vec![0u8; 10]).unwrap();
        fs::write(sub.join("empty"), b"").unwrap();

        let root_len = fs::metadata(&root).unwrap().len();
        let sub_len = fs::metadata(&sub).unwrap().len();

        let usage = measure(&root).unwrap();
        assert_eq!(usage.real, root_len + sub_len + 10);
        assert_eq!(
            usage.metered,
            metered_size(root_len, true) + metered_size(sub_len, true) + 2 * (4096 + 2048)
        );
        assert_eq!(usage.errors, 0);
    }

    #[test]
    fn test_measure_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("one.log");
        fs::write(&path, vec![b'x'; 5000]).unwrap();

        let usage = measure(&path).unwrap();
        assert_eq!(usage.real, 5000);
        assert_eq!(usage.metered, 8192 + 2048);
    }

    #[test]
    fn test_measure_does_not_follow_symlinks() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        let outside = dir.path().join("outside.bin");
        fs::write(&outside, vec![0u8; 100_000]).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("nowhere"), root.join("dangling")).unwrap();

        let usage = measure(&root).unwrap();
        assert!(usage.real < 100_000, "{:?}", usage);
        assert_eq!(usage.errors, 0);
    }

    #[test]
    fn test_measure_missing_root() {
        let dir = TempDir::new().unwrap();
        assert!(measure(&dir.path().join("gone")).is_err());
    }

    #[test]
    fn test_collect_dir_only() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("f"), b"abc").unwrap();
        let pattern = format!("{}/*", dir.path().display());

        let mut config = UsageConfig {
            paths: vec![pattern],
            period: Duration::from_secs(1),
            dir_only: false,
        };
        assert_eq!(collect(&config).len(), 2);

        config.dir_only = true;
        let reports = collect(&config);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, dir.path().join("d"));
    }

    #[test]
    fn test_validate() {
        let mut config = UsageConfig {
            paths: vec!["/mnt/efs/*".into()],
            period: Duration::from_secs(60),
            dir_only: true,
        };
        assert!(config.validate().is_ok());

        config.period = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.period = Duration::from_secs(60);
        config.paths = vec!["/mnt/[".into()];
        assert!(matches!(config.validate(), Err(Error::InvalidGlob(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reporter_publishes_usage_events() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), vec![0u8; 100]).unwrap();

        let sink = RecordingSink::default();
        let config = PipelineConfig {
            max_linger: Duration::from_millis(10),
            ..Default::default()
        };
        let (pipeline, publisher) = Pipeline::new(config, sink.clone());
        let cancel = CancellationToken::new();
        let pipeline_task = tokio::spawn(pipeline.run(cancel.clone()));

        let reporter = UsageReporter::new(
            UsageConfig {
                paths: vec![dir.path().display().to_string()],
                period: Duration::from_millis(50),
                dir_only: true,
            },
            publisher,
        );
        let reporter_task = tokio::spawn(reporter.run(cancel.clone()));

        wait_for(Duration::from_secs(5), || !sink.delivered().is_empty()).await;
        cancel.cancel();
        reporter_task.await.unwrap().unwrap();
        pipeline_task.await.unwrap().unwrap();

        let event = &sink.delivered()[0];
        assert_eq!(event.kind, EventKind::Usage);
        assert!(event.ack_route().is_none());

        let fields: Value = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(fields["path"], dir.path().display().to_string());
        assert!(fields["size.real"].as_u64().unwrap() >= 100);
        assert!(fields["size.efsmetered"].as_u64().unwrap() >= 4096 + 4096 + 2048);
    }
}
