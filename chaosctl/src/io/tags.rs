//! Workload tag filter sources.
//!
//! A source is read once per validation run; the returned filter is an
//! immutable snapshot for that run.

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::tag_filter::WorkloadTagFilter;

pub const WORKLOAD_TAGS_ENV: &str = "CHAOS_WORKLOAD_TAGS";

pub trait TagSource: Send + Sync {
    fn snapshot(&self) -> Result<WorkloadTagFilter>;
}

/// Fixed filter, used when the caller already holds one.
#[derive(Debug, Clone, Default)]
pub struct StaticTags(pub WorkloadTagFilter);

impl TagSource for StaticTags {
    fn snapshot(&self) -> Result<WorkloadTagFilter> {
        Ok(self.0.clone())
    }
}

/// Environment override on top of the configured filter.
///
/// A non-blank `CHAOS_WORKLOAD_TAGS` replaces the configured pairs entirely.
pub struct EnvOrConfigTags<F> {
    configured: WorkloadTagFilter,
    env: F,
}

impl<F> EnvOrConfigTags<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    pub fn new(configured: WorkloadTagFilter, env: F) -> Self {
        Self { configured, env }
    }
}

impl EnvOrConfigTags<fn(&str) -> Option<String>> {
    pub fn from_process_env(configured: WorkloadTagFilter) -> Self {
        fn lookup(key: &str) -> Option<String> {
            std::env::var(key).ok()
        }
        Self::new(configured, lookup)
    }
}

impl<F> TagSource for EnvOrConfigTags<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn snapshot(&self) -> Result<WorkloadTagFilter> {
        match (self.env)(WORKLOAD_TAGS_ENV) {
            Some(raw) if !raw.trim().is_empty() => {
                let filter = WorkloadTagFilter::parse(&raw)
                    .with_context(|| format!("parse {WORKLOAD_TAGS_ENV}"))?;
                debug!(tags = %filter.render(), "workload tags from environment");
                Ok(filter)
            }
            _ => Ok(self.configured.clone()),
        }
    }
}
