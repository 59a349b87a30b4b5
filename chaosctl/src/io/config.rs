//! Controller configuration stored under `.chaos/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffPolicy;
use crate::core::tag_filter::WorkloadTagFilter;

pub const DEFAULT_REGION: &str = "us-east-1";
/// Export published by the stack that provisions the execution role.
pub const DEFAULT_ROLE_EXPORT: &str = "ChaosAgentFISExecutionRoleArn";

/// Controller configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that work
/// against a real account with the AWS CLI on `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Region used when neither the CLI nor the environment names one.
    pub region: Option<String>,

    /// IAM role the fault-injection service assumes for created templates.
    pub execution_role_arn: Option<String>,

    /// Upper bound on concurrently processed experiments in batch mode.
    pub max_parallel: usize,

    /// Required `key = value` tags every target resource must carry.
    pub workload_tags: WorkloadTagFilter,

    /// Declared `action -> fallback action` substitutions.
    pub fallback_actions: BTreeMap<String, String>,

    pub inventory: InventoryConfig,
    pub aws: AwsConfig,
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InventorySource {
    #[default]
    Aws,
    Fixture,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InventoryConfig {
    pub source: InventorySource,
    /// JSON fixture read when `source = "fixture"`.
    pub fixture_path: Option<PathBuf>,
    /// Items requested per list call.
    pub page_size: u32,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            source: InventorySource::Aws,
            fixture_path: None,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AwsConfig {
    /// AWS CLI executable.
    pub binary: String,
    /// kubectl executable used for pod discovery.
    pub kubectl_binary: String,
    pub profile: Option<String>,
    pub command_timeout_secs: u64,
    /// Truncate captured CLI output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// CloudFormation export holding the execution role ARN; consulted when no
    /// role is configured. Empty disables the lookup.
    pub role_export: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            binary: "aws".to_string(),
            kubectl_binary: "kubectl".to_string(),
            profile: None,
            command_timeout_secs: 60,
            output_limit_bytes: 4_000_000,
            role_export: DEFAULT_ROLE_EXPORT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub multiplier: f64,
    pub jitter_ratio: f64,
    /// Overall wall-clock budget for one execution before it is marked timed out.
    pub deadline_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 5,
            max_delay_secs: 60,
            multiplier: 2.0,
            jitter_ratio: 0.1,
            deadline_secs: 60 * 60,
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.initial_delay_secs),
            max: Duration::from_secs(self.max_delay_secs),
            multiplier: self.multiplier,
            jitter_ratio: self.jitter_ratio,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            region: None,
            execution_role_arn: None,
            max_parallel: 4,
            workload_tags: WorkloadTagFilter::default(),
            fallback_actions: BTreeMap::new(),
            inventory: InventoryConfig::default(),
            aws: AwsConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if self.inventory.page_size == 0 {
            return Err(anyhow!("inventory.page_size must be > 0"));
        }
        if self.inventory.source == InventorySource::Fixture
            && self.inventory.fixture_path.is_none()
        {
            return Err(anyhow!(
                "inventory.fixture_path is required when inventory.source = \"fixture\""
            ));
        }
        if self.aws.binary.trim().is_empty() {
            return Err(anyhow!("aws.binary must not be empty"));
        }
        if self.aws.command_timeout_secs == 0 {
            return Err(anyhow!("aws.command_timeout_secs must be > 0"));
        }
        if self.aws.output_limit_bytes == 0 {
            return Err(anyhow!("aws.output_limit_bytes must be > 0"));
        }
        if self.poll.initial_delay_secs == 0 || self.poll.max_delay_secs == 0 {
            return Err(anyhow!("poll delays must be > 0"));
        }
        if self.poll.initial_delay_secs > self.poll.max_delay_secs {
            return Err(anyhow!(
                "poll.initial_delay_secs must not exceed poll.max_delay_secs"
            ));
        }
        if self.poll.multiplier.is_nan() || self.poll.multiplier < 1.0 {
            return Err(anyhow!("poll.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.poll.jitter_ratio) {
            return Err(anyhow!("poll.jitter_ratio must be within 0.0..=1.0"));
        }
        if self.poll.deadline_secs == 0 {
            return Err(anyhow!("poll.deadline_secs must be > 0"));
        }
        for (action, fallback) in &self.fallback_actions {
            if action == fallback {
                return Err(anyhow!("fallback_actions: '{action}' cannot fall back to itself"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ControllerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ControllerConfig> {
    if !path.exists() {
        let cfg = ControllerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ControllerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ControllerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::atomic::write_atomic(path, buf.as_bytes())
}

/// Pick the region: CLI flag, `CHAOS_REGION`, `AWS_REGION`,
/// `AWS_DEFAULT_REGION`, config file, then [`DEFAULT_REGION`].
pub fn resolve_region(
    cli: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
    cfg: &ControllerConfig,
) -> String {
    first_non_empty([
        cli.map(str::to_string),
        env("CHAOS_REGION"),
        env("AWS_REGION"),
        env("AWS_DEFAULT_REGION"),
        cfg.region.clone(),
    ])
    .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// Pick the execution role: CLI flag, `CHAOS_FIS_ROLE_ARN`, then config file.
///
/// `None` leaves the CloudFormation export lookup to the fault service.
pub fn resolve_role_arn(
    cli: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
    cfg: &ControllerConfig,
) -> Option<String> {
    first_non_empty([
        cli.map(str::to_string),
        env("CHAOS_FIS_ROLE_ARN"),
        cfg.execution_role_arn.clone(),
    ])
}

fn first_non_empty<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}
