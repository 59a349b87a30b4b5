//! Shared deterministic types for target resolution and experiment tracking.
//!
//! These types define stable contracts between core components. They must not
//! depend on external state or I/O and serialize identically across runs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::status::ExperimentStatus;

/// Errors raised while parsing descriptor fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("unknown resource type '{0}'")]
    UnknownResourceType(String),
    #[error("invalid selection mode '{0}'")]
    InvalidSelection(String),
}

/// Resource types that can receive a fault-injection action.
///
/// Serialized as the fault-injection service's resource type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "aws:ec2:instance")]
    Ec2Instance,
    #[serde(rename = "aws:eks:nodegroup")]
    EksNodegroup,
    #[serde(rename = "aws:eks:pod")]
    EksPod,
    #[serde(rename = "aws:rds:cluster")]
    RdsCluster,
    #[serde(rename = "aws:rds:db")]
    RdsInstance,
    #[serde(rename = "aws:elasticache:replicationgroup")]
    ElastiCacheReplicationGroup,
    #[serde(rename = "aws:elasticloadbalancing:loadbalancer")]
    LoadBalancer,
}

impl ResourceType {
    pub const ALL: [ResourceType; 7] = [
        ResourceType::Ec2Instance,
        ResourceType::EksNodegroup,
        ResourceType::EksPod,
        ResourceType::RdsCluster,
        ResourceType::RdsInstance,
        ResourceType::ElastiCacheReplicationGroup,
        ResourceType::LoadBalancer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Ec2Instance => "aws:ec2:instance",
            ResourceType::EksNodegroup => "aws:eks:nodegroup",
            ResourceType::EksPod => "aws:eks:pod",
            ResourceType::RdsCluster => "aws:rds:cluster",
            ResourceType::RdsInstance => "aws:rds:db",
            ResourceType::ElastiCacheReplicationGroup => "aws:elasticache:replicationgroup",
            ResourceType::LoadBalancer => "aws:elasticloadbalancing:loadbalancer",
        }
    }

    /// Key the fault-injection action uses to reference this target type.
    pub fn action_target_key(&self) -> &'static str {
        match self {
            ResourceType::Ec2Instance => "Instances",
            ResourceType::EksNodegroup => "Nodegroups",
            ResourceType::EksPod => "Pods",
            ResourceType::RdsCluster => "Clusters",
            ResourceType::RdsInstance => "DBInstances",
            ResourceType::ElastiCacheReplicationGroup => "ReplicationGroups",
            ResourceType::LoadBalancer => "LoadBalancers",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s.trim())
            .ok_or_else(|| DescriptorError::UnknownResourceType(s.to_string()))
    }
}

/// Normalized lifecycle state reported by the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Running,
    Available,
    Active,
    Pending,
    Stopping,
    Stopped,
    Terminated,
    Modifying,
    Failed,
    Deleting,
    Unknown,
}

impl ResourceState {
    /// Normalize a provider status string (case-insensitive).
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => ResourceState::Running,
            "available" => ResourceState::Available,
            "active" => ResourceState::Active,
            "pending" | "creating" | "starting" | "provisioning" | "backing-up" => {
                ResourceState::Pending
            }
            "stopping" | "shutting-down" => ResourceState::Stopping,
            "stopped" => ResourceState::Stopped,
            "terminated" | "deleted" | "succeeded" => ResourceState::Terminated,
            "modifying" | "updating" | "rebooting" | "snapshotting" => ResourceState::Modifying,
            "failed" | "create_failed" | "degraded" | "incompatible-network" => {
                ResourceState::Failed
            }
            "deleting" | "delete_failed" => ResourceState::Deleting,
            _ => ResourceState::Unknown,
        }
    }

    pub fn is_generically_active(&self) -> bool {
        matches!(
            self,
            ResourceState::Running | ResourceState::Available | ResourceState::Active
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Running => "running",
            ResourceState::Available => "available",
            ResourceState::Active => "active",
            ResourceState::Pending => "pending",
            ResourceState::Stopping => "stopping",
            ResourceState::Stopped => "stopped",
            ResourceState::Terminated => "terminated",
            ResourceState::Modifying => "modifying",
            ResourceState::Failed => "failed",
            ResourceState::Deleting => "deleting",
            ResourceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about a resource's placement that precondition rules inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// Replication group, cluster, or node group this resource belongs to.
    pub parent_group: Option<String>,
    /// Member count as reported by the inventory for group-shaped resources.
    pub group_member_count: Option<u32>,
    pub availability_zones: Vec<String>,
    pub desired_size: Option<u32>,
    pub min_size: Option<u32>,
}

/// A concrete resource returned by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    pub resource_type: ResourceType,
    pub state: ResourceState,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub topology: Topology,
}

/// Scope a target is resolved within.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    /// Resource-level tag scope, merged with the workload tag filter.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Quantifier describing how many matching resources to target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionMode {
    Count { count: u32 },
    Percent { percent: u32 },
    All,
    Explicit { ids: Vec<String> },
}

impl SelectionMode {
    /// Reject quantifiers that can never be satisfied.
    pub fn check(&self) -> Result<(), DescriptorError> {
        match self {
            SelectionMode::Count { count: 0 } => Err(DescriptorError::InvalidSelection(
                "COUNT must be >= 1".to_string(),
            )),
            SelectionMode::Percent { percent } if *percent == 0 || *percent > 100 => Err(
                DescriptorError::InvalidSelection(format!("PERCENT({percent}) must be 1..=100")),
            ),
            SelectionMode::Explicit { ids } if ids.is_empty() => Err(
                DescriptorError::InvalidSelection("explicit id list is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::Count { count } => write!(f, "COUNT({count})"),
            SelectionMode::Percent { percent } => write!(f, "PERCENT({percent})"),
            SelectionMode::All => f.write_str("ALL"),
            SelectionMode::Explicit { ids } => write!(f, "EXPLICIT({})", ids.join(",")),
        }
    }
}

impl FromStr for SelectionMode {
    type Err = DescriptorError;

    /// Parse `COUNT(n)`, `PERCENT(p)`, `ALL`, or `EXPLICIT(a,b)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || DescriptorError::InvalidSelection(raw.to_string());
        if raw.eq_ignore_ascii_case("all") {
            return Ok(SelectionMode::All);
        }
        let (head, rest) = raw.split_once('(').ok_or_else(invalid)?;
        let inner = rest.strip_suffix(')').ok_or_else(invalid)?.trim();
        let mode = match head.trim().to_ascii_uppercase().as_str() {
            "COUNT" => SelectionMode::Count {
                count: inner.parse().map_err(|_| invalid())?,
            },
            "PERCENT" => SelectionMode::Percent {
                percent: inner.parse().map_err(|_| invalid())?,
            },
            "EXPLICIT" => SelectionMode::Explicit {
                ids: inner
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            _ => return Err(invalid()),
        };
        mode.check()?;
        Ok(mode)
    }
}

/// Abstract target declared by the upstream producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub resource_type: ResourceType,
    pub selection_mode: SelectionMode,
    #[serde(default)]
    pub scope: ScopeParameters,
}

/// Why a resource was kept or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Eligible,
    Tag,
    State,
    Topology,
    Missing,
}

/// Per-resource eligibility decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub id: String,
    pub eligible: bool,
    pub kind: RejectionKind,
    pub reason: String,
}

impl Eligibility {
    pub fn eligible(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            eligible: true,
            kind: RejectionKind::Eligible,
            reason: reason.into(),
        }
    }

    pub fn rejected(id: impl Into<String>, kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            eligible: false,
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    InsufficientResources,
    InvalidState,
    TopologyViolation,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Valid => "valid",
            ValidationStatus::InsufficientResources => "insufficient_resources",
            ValidationStatus::InvalidState => "invalid_state",
            ValidationStatus::TopologyViolation => "topology_violation",
        }
    }
}

/// Outcome of validating one target descriptor.
///
/// `reasons` lists every discovered resource in resolver order, including
/// those removed by the tag filter, so a failure can be replayed exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub selection_mode: SelectionMode,
    pub matched_resources: Vec<String>,
    pub required_count: u32,
    pub discovered_count: u32,
    pub found_count: u32,
    pub eligible_count: u32,
    pub reasons: Vec<Eligibility>,
    pub rejections: BTreeMap<RejectionKind, u32>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }

    /// One-line shortfall summary, e.g. `required 2, found 3, eligible 1`.
    pub fn shortfall(&self) -> String {
        format!(
            "{}: required {}, found {}, eligible {}",
            self.selection_mode, self.required_count, self.found_count, self.eligible_count
        )
    }
}

/// Record of a declared fallback-action decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    pub from_action: String,
    pub to_action: String,
    pub applied: bool,
    pub reason: String,
}

/// Validation results for every target of one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Action the report was evaluated against (after any substitution).
    pub action_id: String,
    pub targets: BTreeMap<String, ValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitution: Option<Substitution>,
    /// Warnings raised while evaluating (e.g. unknown action ids).
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Stable digest of the action, statuses, and matched sets.
    pub fingerprint: String,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self.targets.is_empty() && self.targets.values().all(ValidationResult::is_valid)
    }

    pub fn matched_ids(&self) -> Vec<String> {
        self.targets
            .values()
            .flat_map(|result| result.matched_resources.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteLevel {
    Info,
    Warning,
    Policy,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteCounts {
    pub required: u32,
    pub found: u32,
    pub eligible: u32,
}

/// Structured diagnostic attached to an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub at: DateTime<Utc>,
    pub status: ExperimentStatus,
    pub level: NoteLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<NoteCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    /// Remote diagnostic payload, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Note {
    pub fn new(status: ExperimentStatus, level: NoteLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            status,
            level,
            message: message.into(),
            resource_ids: Vec::new(),
            counts: None,
            remediation: None,
            payload: None,
        }
    }

    pub fn with_resources(mut self, ids: Vec<String>) -> Self {
        self.resource_ids = ids;
        self
    }

    pub fn with_counts(mut self, counts: NoteCounts) -> Self {
        self.counts = Some(counts);
        self
    }

    pub fn with_remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation = Some(hint.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Timestamped status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Durable experiment state. Created once by the upstream producer and then
/// mutated only by the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis_id: Option<String>,
    #[serde(default)]
    pub title: String,
    pub targets: BTreeMap<String, TargetDescriptor>,
    pub action_id: String,
    #[serde(default)]
    pub action_parameters: BTreeMap<String, String>,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub validation: Option<ValidationReport>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExperimentRecord {
    /// Build a fresh draft as an upstream producer would.
    pub fn draft(
        id: impl Into<String>,
        action_id: impl Into<String>,
        targets: BTreeMap<String, TargetDescriptor>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            hypothesis_id: None,
            title: String::new(),
            targets,
            action_id: action_id.into(),
            action_parameters: BTreeMap::new(),
            status: ExperimentStatus::Draft,
            template_id: None,
            run_id: None,
            validation: None,
            notes: Vec::new(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn last_note(&self) -> Option<&Note> {
        self.notes.last()
    }
}

/// Experiment as handed over by the upstream producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    #[serde(default)]
    pub hypothesis_id: Option<String>,
    #[serde(default)]
    pub title: String,
    pub action_id: String,
    #[serde(default)]
    pub action_parameters: BTreeMap<String, String>,
    pub targets: BTreeMap<String, TargetDescriptor>,
}

impl Submission {
    pub fn into_draft(self) -> ExperimentRecord {
        let mut record = ExperimentRecord::draft(self.id, self.action_id, self.targets);
        record.hypothesis_id = self.hypothesis_id;
        record.title = self.title;
        record.action_parameters = self.action_parameters;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_round_trips_through_str() {
        for ty in ResourceType::ALL {
            assert_eq!(ty.as_str().parse::<ResourceType>(), Ok(ty));
        }
    }

    #[test]
    fn unknown_resource_type_is_classified() {
        let err = "aws:s3:bucket".parse::<ResourceType>().expect_err("unknown");
        assert_eq!(
            err,
            DescriptorError::UnknownResourceType("aws:s3:bucket".to_string())
        );
    }

    #[test]
    fn selection_mode_parses_service_notation() {
        assert_eq!(
            "COUNT(2)".parse::<SelectionMode>(),
            Ok(SelectionMode::Count { count: 2 })
        );
        assert_eq!(
            "percent(50)".parse::<SelectionMode>(),
            Ok(SelectionMode::Percent { percent: 50 })
        );
        assert_eq!("ALL".parse::<SelectionMode>(), Ok(SelectionMode::All));
        assert_eq!(
            "EXPLICIT(i-1, i-2)".parse::<SelectionMode>(),
            Ok(SelectionMode::Explicit {
                ids: vec!["i-1".to_string(), "i-2".to_string()]
            })
        );
    }

    #[test]
    fn selection_mode_rejects_unsatisfiable_quantifiers() {
        assert!("COUNT(0)".parse::<SelectionMode>().is_err());
        assert!("PERCENT(0)".parse::<SelectionMode>().is_err());
        assert!("PERCENT(101)".parse::<SelectionMode>().is_err());
        assert!("EXPLICIT()".parse::<SelectionMode>().is_err());
        assert!("SOME(3)".parse::<SelectionMode>().is_err());
    }

    #[test]
    fn selection_mode_serializes_tagged() {
        let json = serde_json::to_string(&SelectionMode::Percent { percent: 25 }).expect("json");
        assert_eq!(json, r#"{"mode":"percent","percent":25}"#);
    }

    #[test]
    fn provider_states_normalize() {
        assert_eq!(ResourceState::from_provider("RUNNING"), ResourceState::Running);
        assert_eq!(
            ResourceState::from_provider("shutting-down"),
            ResourceState::Stopping
        );
        assert_eq!(ResourceState::from_provider("weird"), ResourceState::Unknown);
        assert!(ResourceState::Available.is_generically_active());
        assert!(!ResourceState::Stopped.is_generically_active());
    }
}
