// SPDX-License-Identifier: Apache-2.0

use glob::{Pattern, glob};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::warn;

use crate::error::{Error, Result};

/// Resolves configured patterns to the files that should be harvested.
pub trait FileFinder: Send + Sync + 'static {
    fn find_files(&self) -> Result<Vec<PathBuf>>;
}

/// Finds files matching include globs while skipping anything an exclude
/// glob matches. Directories are never returned. A directory that cannot be
/// listed only hides what is below it.
#[derive(Debug, Clone)]
pub struct GlobFileFinder {
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl GlobFileFinder {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self> {
        for pattern in &include {
            Pattern::new(pattern)
                .map_err(|e| Error::InvalidGlob(format!("{}: {}", pattern, e)))?;
        }
        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::InvalidGlob(format!("{}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { include, exclude })
    }

    fn is_excluded(&self, path: &std::path::Path) -> bool {
        self.exclude.iter().any(|p| p.matches_path(path))
    }
}

impl FileFinder for GlobFileFinder {
    fn find_files(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let matches = glob(pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

            for entry in matches {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        warn!(path = ?e.path(), error = %e.error(), "Unable to list directory, skipping it");
                        continue;
                    }
                };

                if path.is_dir() || self.is_excluded(&path) {
                    continue;
                }

                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        Ok(paths)
    }
}
