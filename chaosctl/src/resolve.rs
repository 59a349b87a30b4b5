//! Target resolution: descriptor plus scope to a concrete, ordered resource set.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, instrument};

use crate::core::types::{ResourceRecord, ResourceType, ScopeParameters, TargetDescriptor};
use crate::io::inventory::{DiscoveryError, InventoryProvider, InventoryQuery};

/// Upper bound on pages fetched for one query.
pub const MAX_PAGES: u32 = 1_000;

/// Resources for one descriptor, sorted by id and de-duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub resources: Vec<ResourceRecord>,
    /// Why the set is empty without an error (missing or absent scope).
    pub diagnostic: Option<String>,
    pub pages: u32,
}

/// Memoized inventory answers for a single pipeline run.
///
/// Keyed by resource type and the inventory-facing part of the scope; tag scope
/// is applied later by the tag filter and does not change the query.
#[derive(Debug, Default)]
pub struct InventoryCache {
    entries: HashMap<(ResourceType, ScopeParameters), Resolution>,
    hits: u32,
}

impl InventoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cache_key(descriptor: &TargetDescriptor) -> (ResourceType, ScopeParameters) {
    let scope = ScopeParameters {
        tags: BTreeMap::new(),
        ..descriptor.scope.clone()
    };
    (descriptor.resource_type, scope)
}

/// Scope fields a resource type cannot be listed without.
pub fn missing_required_scope(descriptor: &TargetDescriptor) -> Option<String> {
    let scope = &descriptor.scope;
    let mut missing = Vec::new();
    match descriptor.resource_type {
        ResourceType::EksPod => {
            if scope.cluster.is_none() {
                missing.push("cluster");
            }
            if scope.namespace.is_none() {
                missing.push("namespace");
            }
        }
        ResourceType::EksNodegroup => {
            if scope.cluster.is_none() {
                missing.push("cluster");
            }
        }
        _ => {}
    }
    (!missing.is_empty()).then(|| {
        format!(
            "{} targets need scope {}; nothing was queried",
            descriptor.resource_type,
            missing.join(" and ")
        )
    })
}

pub struct Resolver<'a> {
    provider: &'a dyn InventoryProvider,
    region: String,
    page_size: u32,
}

impl<'a> Resolver<'a> {
    pub fn new(provider: &'a dyn InventoryProvider, region: impl Into<String>, page_size: u32) -> Self {
        Self {
            provider,
            region: region.into(),
            page_size: page_size.max(1),
        }
    }

    /// Aggregate every page for `descriptor`.
    ///
    /// A missing or nonexistent scope yields an empty set with a diagnostic;
    /// only unreachable, denied, or malformed inventories are errors.
    #[instrument(skip_all, fields(resource_type = %descriptor.resource_type))]
    pub fn resolve(
        &self,
        descriptor: &TargetDescriptor,
        cache: &mut InventoryCache,
    ) -> Result<Resolution, DiscoveryError> {
        if let Some(diagnostic) = missing_required_scope(descriptor) {
            debug!(%diagnostic, "scope incomplete");
            return Ok(Resolution {
                diagnostic: Some(diagnostic),
                ..Resolution::default()
            });
        }
        let key = cache_key(descriptor);
        if let Some(cached) = cache.entries.get(&key) {
            cache.hits += 1;
            debug!(resources = cached.resources.len(), "inventory cache hit");
            return Ok(cached.clone());
        }
        let resolution = match self.fetch_all(&key.0, &key.1) {
            Ok(resolution) => resolution,
            Err(DiscoveryError::ScopeNotFound(detail)) => Resolution {
                diagnostic: Some(detail),
                ..Resolution::default()
            },
            Err(err) => return Err(err),
        };
        debug!(
            resources = resolution.resources.len(),
            pages = resolution.pages,
            "resolved"
        );
        cache.entries.insert(key, resolution.clone());
        Ok(resolution)
    }

    fn fetch_all(
        &self,
        resource_type: &ResourceType,
        scope: &ScopeParameters,
    ) -> Result<Resolution, DiscoveryError> {
        let query = InventoryQuery {
            resource_type: *resource_type,
            region: self.region.clone(),
            scope: scope.clone(),
            page_size: self.page_size,
        };
        let mut by_id: BTreeMap<String, ResourceRecord> = BTreeMap::new();
        let mut seen_tokens = HashSet::new();
        let mut token: Option<String> = None;
        let mut pages = 0;
        loop {
            if pages >= MAX_PAGES {
                return Err(DiscoveryError::Malformed(format!(
                    "more than {MAX_PAGES} pages for {resource_type}"
                )));
            }
            let page = self.provider.list_page(&query, token.as_deref())?;
            pages += 1;
            for resource in page.resources {
                if resource.resource_type != *resource_type {
                    continue;
                }
                by_id.entry(resource.id.clone()).or_insert(resource);
            }
            match page.next_token {
                Some(next) if !seen_tokens.insert(next.clone()) => {
                    return Err(DiscoveryError::Malformed(format!(
                        "page token '{next}' repeated"
                    )));
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(Resolution {
            resources: by_id.into_values().collect(),
            diagnostic: None,
            pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SelectionMode;
    use crate::io::inventory::{FixtureInventory, InventoryPage};
    use crate::test_support::{ScriptedInventory, instance, tagged_instance};

    fn all(resource_type: ResourceType) -> TargetDescriptor {
        TargetDescriptor {
            resource_type,
            selection_mode: SelectionMode::All,
            scope: ScopeParameters::default(),
        }
    }

    fn ids(resolution: &Resolution) -> Vec<&str> {
        resolution.resources.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn aggregates_pages_sorted_by_id() {
        let inventory = ScriptedInventory::from_resources(vec![
            instance("i-3"),
            instance("i-1"),
            instance("i-2"),
        ]);
        let resolver = Resolver::new(&inventory, "us-east-1", 2);
        let resolution = resolver
            .resolve(&all(ResourceType::Ec2Instance), &mut InventoryCache::new())
            .expect("resolve");
        assert_eq!(ids(&resolution), vec!["i-1", "i-2", "i-3"]);
        assert_eq!(resolution.pages, 2);
        assert_eq!(inventory.calls(), 2);
    }

    #[test]
    fn cache_reuses_answers_across_tag_scopes() {
        let inventory = ScriptedInventory::from_resources(vec![instance("i-1")]);
        let resolver = Resolver::new(&inventory, "us-east-1", 10);
        let mut cache = InventoryCache::new();

        let mut tagged = all(ResourceType::Ec2Instance);
        tagged.scope.tags.insert("env".to_string(), "test".to_string());
        resolver
            .resolve(&all(ResourceType::Ec2Instance), &mut cache)
            .expect("first");
        resolver.resolve(&tagged, &mut cache).expect("second");

        assert_eq!(inventory.calls(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn pods_without_namespace_are_not_queried() {
        let inventory = ScriptedInventory::default();
        let resolver = Resolver::new(&inventory, "us-east-1", 10);
        let mut descriptor = all(ResourceType::EksPod);
        descriptor.scope.cluster = Some("prod".to_string());

        let resolution = resolver
            .resolve(&descriptor, &mut InventoryCache::new())
            .expect("resolve");
        assert!(resolution.resources.is_empty());
        assert!(
            resolution
                .diagnostic
                .as_deref()
                .is_some_and(|d| d.contains("namespace"))
        );
        assert_eq!(inventory.calls(), 0);
    }

    #[test]
    fn absent_cluster_is_an_empty_set_with_diagnostic() {
        let inventory = ScriptedInventory::new(FixtureInventory::default().with_cluster("prod"));
        let resolver = Resolver::new(&inventory, "us-east-1", 10);
        let mut descriptor = all(ResourceType::EksNodegroup);
        descriptor.scope.cluster = Some("staging".to_string());

        let resolution = resolver
            .resolve(&descriptor, &mut InventoryCache::new())
            .expect("resolve");
        assert!(resolution.resources.is_empty());
        assert!(
            resolution
                .diagnostic
                .as_deref()
                .is_some_and(|d| d.contains("staging"))
        );
    }

    #[test]
    fn unreachable_inventory_is_an_error() {
        let inventory = ScriptedInventory::from_resources(vec![instance("i-1")]);
        inventory.fail_with(DiscoveryError::AccessDenied("no ec2:DescribeInstances".to_string()));
        let resolver = Resolver::new(&inventory, "us-east-1", 10);
        let err = resolver
            .resolve(&all(ResourceType::Ec2Instance), &mut InventoryCache::new())
            .expect_err("denied");
        assert!(matches!(err, DiscoveryError::AccessDenied(_)));
    }

    #[test]
    fn duplicate_ids_across_pages_are_dropped() {
        struct Repeating;
        impl InventoryProvider for Repeating {
            fn list_page(
                &self,
                _: &InventoryQuery,
                token: Option<&str>,
            ) -> Result<InventoryPage, DiscoveryError> {
                Ok(match token {
                    None => InventoryPage {
                        resources: vec![tagged_instance("i-2", &[("page", "1")]), instance("i-1")],
                        next_token: Some("t1".to_string()),
                    },
                    Some(_) => InventoryPage {
                        resources: vec![tagged_instance("i-2", &[("page", "2")])],
                        next_token: None,
                    },
                })
            }
        }
        let resolution = Resolver::new(&Repeating, "us-east-1", 10)
            .resolve(&all(ResourceType::Ec2Instance), &mut InventoryCache::new())
            .expect("resolve");
        assert_eq!(ids(&resolution), vec!["i-1", "i-2"]);
        assert_eq!(resolution.resources[1].tags["page"], "1");
    }

    #[test]
    fn repeated_page_token_is_malformed() {
        struct Looping;
        impl InventoryProvider for Looping {
            fn list_page(
                &self,
                _: &InventoryQuery,
                _: Option<&str>,
            ) -> Result<InventoryPage, DiscoveryError> {
                Ok(InventoryPage {
                    resources: Vec::new(),
                    next_token: Some("same".to_string()),
                })
            }
        }
        let err = Resolver::new(&Looping, "us-east-1", 10)
            .resolve(&all(ResourceType::Ec2Instance), &mut InventoryCache::new())
            .expect_err("loop");
        assert!(matches!(err, DiscoveryError::Malformed(_)));
    }
}
