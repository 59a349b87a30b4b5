//! Per-action precondition rules.
//!
//! Each fault-injection action maps to a rule that classifies every candidate
//! resource as eligible or not. Rules see the resource itself plus an
//! [`AggregateContext`] built from the whole resolved set, which carries facts a
//! single record does not (e.g. how many siblings share a replication group).

use std::collections::BTreeMap;
use std::fmt;

use crate::core::types::{Eligibility, RejectionKind, ResourceRecord, ResourceState, ResourceType};

/// Facts derived from the full resolved resource set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateContext {
    siblings: BTreeMap<String, u32>,
}

impl AggregateContext {
    pub fn from_resources(resources: &[ResourceRecord]) -> Self {
        let mut siblings = BTreeMap::new();
        for resource in resources {
            if let Some(group) = &resource.topology.parent_group {
                *siblings.entry(group.clone()).or_insert(0) += 1;
            }
        }
        Self { siblings }
    }

    /// Members in the resource's group: the inventory-reported count when
    /// present, otherwise the number of resolved siblings sharing its parent.
    pub fn member_count(&self, resource: &ResourceRecord) -> u32 {
        if let Some(count) = resource.topology.group_member_count {
            return count;
        }
        resource
            .topology
            .parent_group
            .as_ref()
            .and_then(|group| self.siblings.get(group).copied())
            .unwrap_or(1)
    }
}

pub type Predicate = Box<dyn Fn(&ResourceRecord, &AggregateContext) -> Eligibility + Send + Sync>;

/// A named precondition attached to one action id.
pub struct ActionRule {
    pub action_id: String,
    pub resource_types: Vec<ResourceType>,
    pub summary: String,
    predicate: Predicate,
}

impl fmt::Debug for ActionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRule")
            .field("action_id", &self.action_id)
            .field("resource_types", &self.resource_types)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl ActionRule {
    pub fn new(
        action_id: impl Into<String>,
        resource_types: Vec<ResourceType>,
        summary: impl Into<String>,
        predicate: Predicate,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            resource_types,
            summary: summary.into(),
            predicate,
        }
    }

    pub fn supports(&self, resource_type: ResourceType) -> bool {
        self.resource_types.contains(&resource_type)
    }

    pub fn check(&self, resource: &ResourceRecord, aggregate: &AggregateContext) -> Eligibility {
        if !self.supports(resource.resource_type) {
            return Eligibility::rejected(
                &resource.id,
                RejectionKind::State,
                format!(
                    "action {} does not target {}",
                    self.action_id, resource.resource_type
                ),
            );
        }
        (self.predicate)(resource, aggregate)
    }
}

/// Decisions for every candidate plus an optional warning about the rule used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionOutcome {
    pub decisions: Vec<Eligibility>,
    pub warning: Option<String>,
}

impl PreconditionOutcome {
    pub fn eligible_ids(&self) -> Vec<String> {
        self.decisions
            .iter()
            .filter(|d| d.eligible)
            .map(|d| d.id.clone())
            .collect()
    }
}

/// Registry mapping action ids to precondition rules.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<String, ActionRule>,
}

impl RuleRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in action catalog.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(ActionRule::new(
            "aws:rds:failover-db-cluster",
            vec![ResourceType::RdsCluster],
            "cluster must have >= 2 members",
            all_of(vec![requires_state(&[ResourceState::Available]), min_members(2)]),
        ));
        registry.register(ActionRule::new(
            "aws:rds:reboot-db-instances",
            vec![ResourceType::RdsInstance],
            "instance must be available",
            requires_state(&[ResourceState::Available]),
        ));
        registry.register(ActionRule::new(
            "aws:elasticache:replicationgroup-interrupt-az-power",
            vec![ResourceType::ElastiCacheReplicationGroup],
            "replication group must have >= 2 members",
            all_of(vec![requires_state(&[ResourceState::Available]), min_members(2)]),
        ));
        for action in [
            "aws:ec2:stop-instances",
            "aws:ec2:reboot-instances",
            "aws:ec2:terminate-instances",
        ] {
            registry.register(ActionRule::new(
                action,
                vec![ResourceType::Ec2Instance],
                "instance must be running",
                requires_state(&[ResourceState::Running]),
            ));
        }
        registry.register(ActionRule::new(
            "aws:eks:terminate-nodegroup-instances",
            vec![ResourceType::EksNodegroup],
            "node group must be active with desired size >= 2",
            all_of(vec![
                requires_state(&[ResourceState::Active]),
                min_desired_size(2),
            ]),
        ));
        for action in [
            "aws:eks:pod-delete",
            "aws:eks:pod-cpu-stress",
            "aws:eks:pod-memory-stress",
            "aws:eks:pod-network-latency",
        ] {
            registry.register(ActionRule::new(
                action,
                vec![ResourceType::EksPod],
                "pod must be running",
                requires_state(&[ResourceState::Running]),
            ));
        }
        registry.register(ActionRule::new(
            "aws:arc:start-zonal-autoshift",
            vec![ResourceType::LoadBalancer],
            "load balancer must be active in >= 2 availability zones",
            all_of(vec![requires_state(&[ResourceState::Active]), min_zones(2)]),
        ));
        registry
    }

    /// Add or replace the rule for `rule.action_id`.
    pub fn register(&mut self, rule: ActionRule) {
        self.rules.insert(rule.action_id.clone(), rule);
    }

    pub fn get(&self, action_id: &str) -> Option<&ActionRule> {
        self.rules.get(action_id)
    }

    pub fn action_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// `None` when the action is not registered.
    pub fn supports(&self, action_id: &str, resource_type: ResourceType) -> Option<bool> {
        self.get(action_id).map(|rule| rule.supports(resource_type))
    }

    /// Classify every candidate for `action_id`.
    ///
    /// Unregistered actions use the permissive default (eligible iff the
    /// resource is generically active) and return a warning.
    pub fn evaluate(
        &self,
        action_id: &str,
        resources: &[ResourceRecord],
        aggregate: &AggregateContext,
    ) -> PreconditionOutcome {
        match self.get(action_id) {
            Some(rule) => PreconditionOutcome {
                decisions: resources
                    .iter()
                    .map(|resource| rule.check(resource, aggregate))
                    .collect(),
                warning: None,
            },
            None => PreconditionOutcome {
                decisions: resources.iter().map(permissive_default).collect(),
                warning: Some(format!(
                    "no precondition rule for action '{action_id}'; using permissive default (resource must be active)"
                )),
            },
        }
    }
}

fn permissive_default(resource: &ResourceRecord) -> Eligibility {
    if resource.state.is_generically_active() {
        Eligibility::eligible(&resource.id, format!("state {}", resource.state))
    } else {
        Eligibility::rejected(
            &resource.id,
            RejectionKind::State,
            format!("state {} is not active", resource.state),
        )
    }
}

/// Resource must be in one of `states`.
pub fn requires_state(states: &'static [ResourceState]) -> Predicate {
    Box::new(move |resource: &ResourceRecord, _: &AggregateContext| {
        if states.contains(&resource.state) {
            Eligibility::eligible(&resource.id, format!("state {}", resource.state))
        } else {
            let wanted = states
                .iter()
                .map(ResourceState::as_str)
                .collect::<Vec<_>>()
                .join("|");
            Eligibility::rejected(
                &resource.id,
                RejectionKind::State,
                format!("requires state {wanted}, found {}", resource.state),
            )
        }
    })
}

/// Group must have at least `min` members.
pub fn min_members(min: u32) -> Predicate {
    Box::new(move |resource: &ResourceRecord, aggregate: &AggregateContext| {
        let found = aggregate.member_count(resource);
        if found >= min {
            Eligibility::eligible(&resource.id, format!("{found} members"))
        } else {
            Eligibility::rejected(
                &resource.id,
                RejectionKind::Topology,
                format!("requires >= {min} members, found {found}"),
            )
        }
    })
}

/// Resource must span at least `min` availability zones.
pub fn min_zones(min: u32) -> Predicate {
    Box::new(move |resource: &ResourceRecord, _: &AggregateContext| {
        let found = resource.topology.availability_zones.len() as u32;
        if found >= min {
            Eligibility::eligible(&resource.id, format!("{found} availability zones"))
        } else {
            Eligibility::rejected(
                &resource.id,
                RejectionKind::Topology,
                format!("requires >= {min} availability zones, found {found}"),
            )
        }
    })
}

/// Node group desired size must be at least `min` so a node survives removal.
pub fn min_desired_size(min: u32) -> Predicate {
    Box::new(move |resource: &ResourceRecord, _: &AggregateContext| {
        match resource.topology.desired_size {
            Some(found) if found >= min => {
                Eligibility::eligible(&resource.id, format!("desired size {found}"))
            }
            Some(found) => Eligibility::rejected(
                &resource.id,
                RejectionKind::Topology,
                format!("requires desired size >= {min}, found {found}"),
            ),
            None => Eligibility::rejected(
                &resource.id,
                RejectionKind::Topology,
                "desired size unknown",
            ),
        }
    })
}

/// First rejection wins; reasons of passing predicates are joined.
pub fn all_of(predicates: Vec<Predicate>) -> Predicate {
    Box::new(move |resource: &ResourceRecord, aggregate: &AggregateContext| {
        let mut reasons = Vec::new();
        for predicate in &predicates {
            let decision = predicate(resource, aggregate);
            if !decision.eligible {
                return decision;
            }
            reasons.push(decision.reason);
        }
        Eligibility::eligible(&resource.id, reasons.join(", "))
    })
}

/// Declared `action -> fallback action` substitutions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackTable {
    entries: BTreeMap<String, String>,
}

impl FallbackTable {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn fallback_for(&self, action_id: &str) -> Option<&str> {
        self.entries.get(action_id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
