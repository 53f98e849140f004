// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::harvester::HarvesterConfig;
use crate::init::batch::{BatchArgs, build_pipeline_config};
use crate::init::retry::RetryArgs;
use crate::metering::UsageConfig;
use crate::prospector::ProspectorConfig;
use crate::publisher::PipelineConfig;

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Glob patterns of files to harvest
    #[arg(long, env = "EFSBEAT_INCLUDE", value_delimiter = ',', required = true)]
    pub include: Vec<String>,

    /// Glob patterns of files to skip even when included
    #[arg(long, env = "EFSBEAT_EXCLUDE", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Registry file holding committed offsets
    #[arg(
        long,
        env = "EFSBEAT_REGISTRY_PATH",
        default_value = "/var/lib/efsbeat/registry.json"
    )]
    pub registry_path: PathBuf,

    /// How often include patterns are re-evaluated
    #[arg(long, env = "EFSBEAT_SCAN_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    pub scan_interval: Duration,

    /// How long discovery may keep failing before the agent stops
    #[arg(long, env = "EFSBEAT_MAX_SCAN_FAILURE_DURATION", default_value = "5m", value_parser = humantime::parse_duration)]
    pub max_scan_failure_duration: Duration,

    /// Maximum files harvested at once, 0 for no limit
    #[arg(long, env = "EFSBEAT_MAX_HARVESTERS", default_value = "0")]
    pub max_harvesters: usize,

    /// Forget offsets of files unseen for this long
    #[arg(long, env = "EFSBEAT_CLEAN_INACTIVE", value_parser = humantime::parse_duration)]
    pub clean_inactive: Option<Duration>,

    /// How often a busy harvester checks for truncation and rotation
    #[arg(long, env = "EFSBEAT_CHECK_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    pub check_interval: Duration,

    /// First wait at end of file
    #[arg(long, env = "EFSBEAT_BACKOFF", default_value = "1s", value_parser = humantime::parse_duration)]
    pub backoff: Duration,

    /// Longest wait at end of file
    #[arg(long, env = "EFSBEAT_MAX_BACKOFF", default_value = "10s", value_parser = humantime::parse_duration)]
    pub max_backoff: Duration,

    /// How long a finishing harvester waits for outstanding acknowledgments
    #[arg(long, env = "EFSBEAT_CLOSE_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub close_timeout: Duration,

    /// Bytes requested per read
    #[arg(long, env = "EFSBEAT_READ_BUFFER_BYTES", default_value = "16384")]
    pub read_buffer_bytes: usize,

    /// Lines longer than this are split
    #[arg(long, env = "EFSBEAT_MAX_LINE_BYTES", default_value = "10485760")]
    pub max_line_bytes: usize,

    #[command(flatten)]
    pub batch: BatchArgs,

    #[command(flatten)]
    pub retry: RetryArgs,

    /// Where events are written
    #[arg(value_enum, long, env = "EFSBEAT_OUTPUT", default_value = "stdout")]
    pub output: OutputKind,

    /// File for the file output
    #[arg(long, env = "EFSBEAT_OUTPUT_PATH", required_if_eq("output", "file"))]
    pub output_path: Option<PathBuf>,

    #[command(flatten)]
    pub usage: UsageArgs,

    /// Time allowed for delivering buffered events at shutdown
    #[arg(long, env = "EFSBEAT_SHUTDOWN_GRACE", default_value = "10s", value_parser = humantime::parse_duration)]
    pub shutdown_grace: Duration,

    /// File created once the agent is running and removed when it stops
    #[arg(long, env = "EFSBEAT_READY_FILE")]
    pub ready_file: Option<PathBuf>,
}

impl Default for AgentRun {
    fn default() -> Self {
        let prospector = ProspectorConfig::default();
        let harvester = HarvesterConfig::default();
        AgentRun {
            include: Vec::new(),
            exclude: Vec::new(),
            registry_path: PathBuf::from("/var/lib/efsbeat/registry.json"),
            scan_interval: prospector.scan_interval,
            max_scan_failure_duration: prospector.max_scan_failure_duration,
            max_harvesters: prospector.max_harvesters,
            clean_inactive: None,
            check_interval: harvester.check_interval,
            backoff: harvester.backoff,
            max_backoff: harvester.max_backoff,
            close_timeout: harvester.close_timeout,
            read_buffer_bytes: harvester.read_buffer_bytes,
            max_line_bytes: harvester.max_line_bytes,
            batch: BatchArgs::default(),
            retry: RetryArgs::default(),
            output: OutputKind::Stdout,
            output_path: None,
            usage: UsageArgs::default(),
            shutdown_grace: Duration::from_secs(10),
            ready_file: None,
        }
    }
}

impl AgentRun {
    pub fn harvester_config(&self) -> HarvesterConfig {
        HarvesterConfig {
            check_interval: self.check_interval,
            backoff: self.backoff,
            max_backoff: self.max_backoff,
            close_timeout: self.close_timeout,
            read_buffer_bytes: self.read_buffer_bytes,
            max_line_bytes: self.max_line_bytes,
            ..Default::default()
        }
    }

    pub fn prospector_config(&self) -> ProspectorConfig {
        ProspectorConfig {
            scan_interval: self.scan_interval,
            max_scan_failure_duration: self.max_scan_failure_duration,
            max_harvesters: self.max_harvesters,
            clean_inactive: self.clean_inactive,
            shutdown_grace: self.shutdown_grace,
            harvester: self.harvester_config(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        build_pipeline_config(&self.batch, &self.retry, self.shutdown_grace)
    }

    /// None unless both usage paths and a period are set.
    pub fn usage_config(&self) -> Option<UsageConfig> {
        match (self.usage.usage_paths.is_empty(), self.usage.usage_period) {
            (false, Some(period)) => Some(UsageConfig {
                paths: self.usage.usage_paths.clone(),
                period,
                dir_only: self.usage.usage_dir_only,
            }),
            _ => None,
        }
    }
}

// Usage reporter settings
#[derive(Debug, Clone, Default, Args)]
pub struct UsageArgs {
    /// Glob patterns of paths whose size is reported
    #[arg(long, env = "EFSBEAT_USAGE_PATHS", value_delimiter = ',')]
    pub usage_paths: Vec<String>,

    /// How often usage is reported, disabled when unset
    #[arg(long, env = "EFSBEAT_USAGE_PERIOD", value_parser = humantime::parse_duration)]
    pub usage_period: Option<Duration>,

    /// Only report usage for directories
    #[arg(long, env = "EFSBEAT_USAGE_DIR_ONLY", default_value = "false")]
    pub usage_dir_only: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum OutputKind {
    Stdout,
    File,
    Blackhole,
}
