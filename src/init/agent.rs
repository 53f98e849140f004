// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BoxError;
use crate::init::args::{AgentRun, OutputKind};
use crate::init::wait::{self, TaskSet};
use crate::metering::UsageReporter;
use crate::outputs::{BlackholeSink, NdjsonSink, Output};
use crate::prospector::{GlobFileFinder, Prospector};
use crate::publisher::{Pipeline, Sink};
use crate::readiness::Readiness;
use crate::registry::Registry;

// Extra time on top of the grace period before a stage counts as stuck
const STAGE_SLACK: Duration = Duration::from_secs(1);

pub struct Agent {
    config: Box<AgentRun>,
    readiness: Readiness,
}

impl Agent {
    pub fn new(config: Box<AgentRun>) -> Self {
        let readiness = Readiness::new(config.ready_file.clone());
        Self { config, readiness }
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Run with the output selected on the command line.
    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        let output = match self.config.output {
            OutputKind::Stdout => Output::Ndjson(NdjsonSink::stdout()),
            OutputKind::Blackhole => Output::Blackhole(BlackholeSink::new()),
            OutputKind::File => {
                let path = self
                    .config
                    .output_path
                    .clone()
                    .ok_or("file output requires --output-path")?;
                let sink = NdjsonSink::file(&path)
                    .await
                    .map_err(|e| format!("unable to open output file {:?}: {}", path, e))?;
                Output::Ndjson(sink)
            }
        };
        self.run_with_sink(output, agent_cancel).await
    }

    /// Run until `agent_cancel` fires or a component fails, then drain.
    pub async fn run_with_sink<S: Sink>(
        self,
        sink: S,
        agent_cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let config = self.config;
        let prospector_config = config.prospector_config();
        let pipeline_config = config.pipeline_config();
        let usage_config = config.usage_config();

        prospector_config.validate()?;
        pipeline_config.validate()?;
        if let Some(usage) = &usage_config {
            usage.validate()?;
        }

        let finder = GlobFileFinder::new(config.include.clone(), config.exclude.clone())?;

        let registry_path = config.registry_path.clone();
        let registry = match tokio::task::spawn_blocking(move || Registry::open(registry_path))
            .await?
        {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                error!(error = %e, "Unable to open registry, refusing to start");
                return Err(e.into());
            }
        };

        let shutdown_grace = pipeline_config.shutdown_grace;
        let (pipeline, publisher) = Pipeline::new(pipeline_config, sink);
        let pipeline_stats = pipeline.stats();

        let mut source_tasks = TaskSet::new();
        let mut pipeline_tasks = TaskSet::new();
        let sources_cancel = CancellationToken::new();
        let pipeline_cancel = CancellationToken::new();

        {
            let token = pipeline_cancel.clone();
            pipeline_tasks.spawn(async move { pipeline.run(token).await });
        }

        if let Some(usage) = usage_config {
            let reporter = UsageReporter::new(usage, publisher.clone());
            let token = sources_cancel.clone();
            source_tasks.spawn(async move { reporter.run(token).await });
        }

        let (first_scan_tx, first_scan_rx) = oneshot::channel();
        {
            let prospector = Prospector::new(prospector_config, finder, registry, publisher);
            let token = sources_cancel.clone();
            source_tasks.spawn(async move { prospector.run(token, Some(first_scan_tx)).await });
        }

        let ready = {
            let readiness = self.readiness.clone();
            async move {
                if first_scan_rx.await.is_ok() {
                    while !pipeline_stats.is_accepting() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    readiness.mark_running();
                }
                std::future::pending::<()>().await
            }
        };
        tokio::pin!(ready);

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            _ = &mut ready => {},
            e = wait::wait_for_any_task(&mut source_tasks) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of input."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut pipeline_tasks) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of pipeline."),
                    Err(e) => result = Err(e),
                }
            },
        }

        self.readiness.clear();
        info!(grace = ?shutdown_grace, "Draining");

        // Harvesters finish while the pipeline drains, both bounded by the
        // same grace period.
        let stop_at = Instant::now() + shutdown_grace + STAGE_SLACK;
        sources_cancel.cancel();
        pipeline_cancel.cancel();

        for (stage, tasks) in [("Inputs", &mut source_tasks), ("Pipeline", &mut pipeline_tasks)] {
            if let Err(e) = wait::wait_for_tasks_with_deadline(tasks, stop_at).await {
                warn!(error = %e, "{} did not stop cleanly", stage);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if result.is_ok() {
            info!("Agent stopped");
        }
        result
    }
}
