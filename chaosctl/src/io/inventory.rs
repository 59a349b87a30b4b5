//! Read-only resource inventory.
//!
//! Providers expose paginated list calls and nothing else. Aggregating pages,
//! caching, and ordering are the resolver's job.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::types::{ResourceRecord, ResourceType, ScopeParameters};

/// Why the inventory could not answer a list call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("inventory unreachable: {0}")]
    Unreachable(String),
    #[error("inventory access denied: {0}")]
    AccessDenied(String),
    /// The scope (cluster, namespace) named by the descriptor does not exist.
    #[error("scope not found: {0}")]
    ScopeNotFound(String),
    #[error("malformed inventory response: {0}")]
    Malformed(String),
}

/// One list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryQuery {
    pub resource_type: ResourceType,
    pub region: String,
    pub scope: ScopeParameters,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryPage {
    pub resources: Vec<ResourceRecord>,
    pub next_token: Option<String>,
}

/// Read-only, paginated resource listing.
pub trait InventoryProvider: Send + Sync {
    fn list_page(
        &self,
        query: &InventoryQuery,
        page_token: Option<&str>,
    ) -> Result<InventoryPage, DiscoveryError>;
}

/// A resource plus the placement facts fixtures use for scope matching.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FixtureEntry {
    #[serde(flatten)]
    pub resource: ResourceRecord,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl FixtureEntry {
    pub fn new(resource: ResourceRecord) -> Self {
        Self {
            resource,
            region: None,
            cluster: None,
            namespace: None,
            labels: BTreeMap::new(),
        }
    }

    fn in_scope(&self, query: &InventoryQuery) -> bool {
        if self.resource.resource_type != query.resource_type {
            return false;
        }
        if let Some(region) = &self.region
            && region != &query.region
        {
            return false;
        }
        let scope = &query.scope;
        if scope.cluster.is_some() && self.cluster != scope.cluster {
            return false;
        }
        if scope.namespace.is_some() && self.namespace != scope.namespace {
            return false;
        }
        match scope.label_selector.as_deref() {
            Some(selector) => label_selector_matches(selector, &self.labels),
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Listing(Vec<FixtureEntry>),
    Document {
        #[serde(default)]
        clusters: Vec<String>,
        resources: Vec<FixtureEntry>,
    },
}

/// Inventory served from a JSON document.
///
/// Page tokens are offsets into the filtered, file-ordered listing.
#[derive(Debug, Clone, Default)]
pub struct FixtureInventory {
    entries: Vec<FixtureEntry>,
    clusters: BTreeSet<String>,
}

impl FixtureInventory {
    pub fn new(entries: Vec<FixtureEntry>) -> Self {
        let clusters = entries.iter().filter_map(|e| e.cluster.clone()).collect();
        Self { entries, clusters }
    }

    pub fn from_resources(resources: Vec<ResourceRecord>) -> Self {
        Self::new(resources.into_iter().map(FixtureEntry::new).collect())
    }

    /// Declare a cluster that exists even if no fixture entry sits in it.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.clusters.insert(cluster.into());
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read fixture {}", path.display()))?;
        let parsed: FixtureFile = serde_json::from_str(&contents)
            .with_context(|| format!("parse fixture {}", path.display()))?;
        Ok(match parsed {
            FixtureFile::Listing(entries) => Self::new(entries),
            FixtureFile::Document { clusters, resources } => {
                let mut inventory = Self::new(resources);
                inventory.clusters.extend(clusters);
                inventory
            }
        })
    }
}

impl InventoryProvider for FixtureInventory {
    #[instrument(skip_all, fields(resource_type = %query.resource_type, page_token = ?page_token))]
    fn list_page(
        &self,
        query: &InventoryQuery,
        page_token: Option<&str>,
    ) -> Result<InventoryPage, DiscoveryError> {
        if let Some(cluster) = &query.scope.cluster
            && !self.clusters.contains(cluster)
        {
            return Err(DiscoveryError::ScopeNotFound(format!(
                "cluster '{cluster}' does not exist"
            )));
        }
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| DiscoveryError::Malformed(format!("bad page token '{token}'")))?,
            None => 0,
        };
        let matching: Vec<&FixtureEntry> =
            self.entries.iter().filter(|e| e.in_scope(query)).collect();
        let page_size = query.page_size.max(1) as usize;
        let end = (offset + page_size).min(matching.len());
        let resources = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|e| e.resource.clone())
            .collect::<Vec<_>>();
        let next_token = (end < matching.len()).then(|| end.to_string());
        debug!(returned = resources.len(), more = next_token.is_some(), "fixture page");
        Ok(InventoryPage {
            resources,
            next_token,
        })
    }
}

/// Equality-based selectors only: `app=web,tier!=db`.
pub fn label_selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .all(|clause| {
            if let Some((key, value)) = clause.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = clause.split_once('=') {
                let value = value.trim_start_matches('=').trim();
                labels.get(key.trim()).map(String::as_str) == Some(value)
            } else {
                labels.contains_key(clause)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ResourceState;
    use crate::test_support::instance;

    fn query(resource_type: ResourceType, page_size: u32) -> InventoryQuery {
        InventoryQuery {
            resource_type,
            region: "us-east-1".to_string(),
            scope: ScopeParameters::default(),
            page_size,
        }
    }

    fn pod(id: &str, cluster: &str, namespace: &str, app: &str) -> FixtureEntry {
        let mut resource = instance(id);
        resource.resource_type = ResourceType::EksPod;
        resource.state = ResourceState::Running;
        let mut entry = FixtureEntry::new(resource);
        entry.cluster = Some(cluster.to_string());
        entry.namespace = Some(namespace.to_string());
        entry.labels.insert("app".to_string(), app.to_string());
        entry
    }

    #[test]
    fn pages_through_matching_entries() {
        let inventory = FixtureInventory::from_resources(vec![
            instance("i-1"),
            instance("i-2"),
            instance("i-3"),
        ]);
        let q = query(ResourceType::Ec2Instance, 2);

        let first = inventory.list_page(&q, None).expect("page 1");
        assert_eq!(first.resources.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("2"));

        let second = inventory.list_page(&q, Some("2")).expect("page 2");
        assert_eq!(second.resources.len(), 1);
        assert!(second.next_token.is_none());
    }

    #[test]
    fn filters_by_type_and_scope() {
        let inventory = FixtureInventory::new(vec![
            pod("web-1", "prod", "shop", "web"),
            pod("db-1", "prod", "shop", "db"),
            pod("web-2", "prod", "other", "web"),
            FixtureEntry::new(instance("i-1")),
        ]);
        let mut q = query(ResourceType::EksPod, 10);
        q.scope.cluster = Some("prod".to_string());
        q.scope.namespace = Some("shop".to_string());
        q.scope.label_selector = Some("app=web".to_string());

        let page = inventory.list_page(&q, None).expect("page");
        let ids: Vec<_> = page.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["web-1"]);
    }

    #[test]
    fn unknown_cluster_is_scope_not_found() {
        let inventory = FixtureInventory::default().with_cluster("prod");
        let mut q = query(ResourceType::EksNodegroup, 10);
        q.scope.cluster = Some("staging".to_string());
        let err = inventory.list_page(&q, None).expect_err("missing cluster");
        assert!(matches!(err, DiscoveryError::ScopeNotFound(_)));

        q.scope.cluster = Some("prod".to_string());
        assert!(inventory.list_page(&q, None).expect("page").resources.is_empty());
    }

    #[test]
    fn loads_listing_and_document_forms() {
        let temp = tempfile::tempdir().expect("tempdir");
        let listing = temp.path().join("listing.json");
        fs::write(
            &listing,
            r#"[{"id":"i-1","resource_type":"aws:ec2:instance","state":"running","tags":{"env":"test"}}]"#,
        )
        .expect("write");
        let inventory = FixtureInventory::load(&listing).expect("load listing");
        let page = inventory
            .list_page(&query(ResourceType::Ec2Instance, 10), None)
            .expect("page");
        assert_eq!(page.resources[0].tags.get("env").map(String::as_str), Some("test"));

        let document = temp.path().join("document.json");
        fs::write(&document, r#"{"clusters":["prod"],"resources":[]}"#).expect("write");
        let inventory = FixtureInventory::load(&document).expect("load document");
        let mut q = query(ResourceType::EksPod, 10);
        q.scope.cluster = Some("prod".to_string());
        assert!(inventory.list_page(&q, None).is_ok());
    }

    #[test]
    fn label_selectors_support_equality_and_inequality() {
        let labels: BTreeMap<String, String> = [("app", "web"), ("tier", "front")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(label_selector_matches("app=web", &labels));
        assert!(label_selector_matches("app==web, tier!=db", &labels));
        assert!(label_selector_matches("tier", &labels));
        assert!(!label_selector_matches("app=db", &labels));
        assert!(!label_selector_matches("tier!=front", &labels));
    }
}
