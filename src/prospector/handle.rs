// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::harvester::{Directive, HarvesterControl, HarvesterState, HarvesterStatus};
use crate::registry::FileId;

/// The prospector's record of one running harvester.
pub struct HarvesterHandle {
    path: PathBuf,
    expected: FileId,
    control: HarvesterControl,
    task: JoinHandle<HarvesterStatus>,
    directive: Directive,
}

impl HarvesterHandle {
    pub fn new(
        path: PathBuf,
        expected: FileId,
        control: HarvesterControl,
        task: JoinHandle<HarvesterStatus>,
    ) -> Self {
        Self {
            path,
            expected,
            control,
            task,
            directive: Directive::Run,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity of the file actually being read, falling back to the one
    /// seen at discovery until the harvester has opened it.
    pub fn identity(&self) -> FileId {
        self.control.status.borrow().identity.unwrap_or(self.expected)
    }

    pub fn committed_offset(&self) -> u64 {
        self.control.status.borrow().committed_offset
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Send a directive. Directives only escalate; asking a draining
    /// harvester to run again is ignored.
    pub fn direct(&mut self, directive: Directive) {
        if directive <= self.directive {
            return;
        }
        debug!(path = ?self.path, ?directive, "Directing harvester");
        self.directive = directive;
        // The harvester may already be gone, which is what we want anyway.
        let _ = self.control.directives.send(directive);
    }

    /// Wait for the task to end. A panicked task is reported as stopped.
    pub async fn join(self) -> HarvesterStatus {
        let last = self.control.status.borrow().clone();
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                debug!(path = ?self.path, error = %e, "Harvester task did not complete");
                HarvesterStatus {
                    state: HarvesterState::Stopped,
                    ..last
                }
            }
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }
}
