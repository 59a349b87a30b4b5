//! Workload tag filtering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::ResourceRecord;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagParseError {
    #[error("invalid tag format '{0}': expected 'key=value' or 'key:value'")]
    MissingSeparator(String),
    #[error("invalid tag format '{0}': key and value cannot be empty")]
    EmptyPart(String),
}

/// Required `key=value` pairs with AND semantics. Empty means no filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadTagFilter {
    required: BTreeMap<String, String>,
}

impl WorkloadTagFilter {
    pub fn new(required: BTreeMap<String, String>) -> Self {
        Self { required }
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            required: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse `Environment=prod,Application=web`, the space-separated form, or
    /// `key:value` pairs.
    pub fn parse(raw: &str) -> Result<Self, TagParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let pairs: Vec<&str> = if raw.contains(',') {
            raw.split(',').map(str::trim).collect()
        } else {
            raw.split_whitespace().collect()
        };
        let mut required = BTreeMap::new();
        for pair in pairs.into_iter().filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .or_else(|| pair.split_once(':'))
                .ok_or_else(|| TagParseError::MissingSeparator(pair.to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(TagParseError::EmptyPart(pair.to_string()));
            }
            required.insert(key.to_string(), value.to_string());
        }
        Ok(Self { required })
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    pub fn pairs(&self) -> &BTreeMap<String, String> {
        &self.required
    }

    /// True if every required pair is present with an identical value.
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }

    /// Merge with a descriptor's scope tags.
    ///
    /// Returns the conflicting keys when both sides require different values for
    /// the same key; such a filter can match nothing.
    pub fn merged_with(
        &self,
        scope_tags: &BTreeMap<String, String>,
    ) -> Result<WorkloadTagFilter, Vec<String>> {
        let mut merged = self.required.clone();
        let mut conflicts = Vec::new();
        for (key, value) in scope_tags {
            match merged.get(key) {
                Some(existing) if existing != value => conflicts.push(key.clone()),
                _ => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        if conflicts.is_empty() {
            Ok(WorkloadTagFilter { required: merged })
        } else {
            Err(conflicts)
        }
    }

    /// Render as `k=v,k2=v2` in key order.
    pub fn render(&self) -> String {
        self.required
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Split resources into (kept, removed), preserving input order.
///
/// An empty filter returns the input unchanged.
pub fn apply_tag_filter(
    resources: Vec<ResourceRecord>,
    filter: &WorkloadTagFilter,
) -> (Vec<ResourceRecord>, Vec<ResourceRecord>) {
    if filter.is_empty() {
        return (resources, Vec::new());
    }
    resources
        .into_iter()
        .partition(|resource| filter.matches(&resource.tags))
}

/// Describe the first required pair a resource is missing.
pub fn missing_tag_reason(filter: &WorkloadTagFilter, resource: &ResourceRecord) -> String {
    for (key, value) in filter.pairs() {
        match resource.tags.get(key) {
            None => return format!("missing tag {key}={value}"),
            Some(actual) if actual != value => {
                return format!("tag {key}={actual} does not match required {key}={value}");
            }
            _ => {}
        }
    }
    "tags match".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::instance;

    fn tagged(id: &str, tags: &[(&str, &str)]) -> ResourceRecord {
        let mut record = instance(id);
        record.tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        record
    }

    #[test]
    fn superset_filter_keeps_only_matching_resources() {
        let first = tagged("i-1", &[("A", "1"), ("B", "2")]);
        let second = tagged("i-2", &[("A", "1")]);
        let filter = WorkloadTagFilter::from_pairs([("A", "1"), ("B", "2")]);

        let (kept, removed) = apply_tag_filter(vec![first.clone(), second.clone()], &filter);
        assert_eq!(kept, vec![first]);
        assert_eq!(removed, vec![second]);
    }

    #[test]
    fn empty_filter_passes_through() {
        let input = vec![tagged("i-1", &[("A", "1")]), tagged("i-2", &[])];
        let (kept, removed) = apply_tag_filter(input.clone(), &WorkloadTagFilter::default());
        assert_eq!(kept, input);
        assert!(removed.is_empty());
    }

    #[test]
    fn matching_is_case_sensitive() {
        let filter = WorkloadTagFilter::from_pairs([("env", "test")]);
        assert!(!filter.matches(&tagged("i-1", &[("env", "Test")]).tags));
        assert!(!filter.matches(&tagged("i-1", &[("Env", "test")]).tags));
        assert!(filter.matches(&tagged("i-1", &[("env", "test")]).tags));
    }

    #[test]
    fn parse_accepts_comma_space_and_colon_forms() {
        let expected = WorkloadTagFilter::from_pairs([("Application", "web"), ("Environment", "prod")]);
        assert_eq!(
            WorkloadTagFilter::parse("Environment=prod,Application=web"),
            Ok(expected.clone())
        );
        assert_eq!(
            WorkloadTagFilter::parse("Environment=prod Application=web"),
            Ok(expected.clone())
        );
        assert_eq!(
            WorkloadTagFilter::parse("Environment:prod, Application:web"),
            Ok(expected)
        );
        assert_eq!(WorkloadTagFilter::parse("  "), Ok(WorkloadTagFilter::default()));
    }

    #[test]
    fn parse_rejects_malformed_pairs() {
        assert_eq!(
            WorkloadTagFilter::parse("Environment"),
            Err(TagParseError::MissingSeparator("Environment".to_string()))
        );
        assert_eq!(
            WorkloadTagFilter::parse("Environment="),
            Err(TagParseError::EmptyPart("Environment=".to_string()))
        );
    }

    #[test]
    fn merge_reports_conflicting_keys() {
        let workload = WorkloadTagFilter::from_pairs([("env", "prod")]);
        let scope: BTreeMap<String, String> =
            [("env".to_string(), "test".to_string())].into_iter().collect();
        assert_eq!(workload.merged_with(&scope), Err(vec!["env".to_string()]));

        let scope: BTreeMap<String, String> =
            [("app".to_string(), "web".to_string())].into_iter().collect();
        let merged = workload.merged_with(&scope).expect("merge");
        assert_eq!(merged.render(), "app=web,env=prod");
    }

    #[test]
    fn missing_tag_reason_names_the_pair() {
        let filter = WorkloadTagFilter::from_pairs([("env", "test")]);
        assert_eq!(
            missing_tag_reason(&filter, &tagged("i-1", &[])),
            "missing tag env=test"
        );
        assert_eq!(
            missing_tag_reason(&filter, &tagged("i-1", &[("env", "prod")])),
            "tag env=prod does not match required env=test"
        );
    }
}
