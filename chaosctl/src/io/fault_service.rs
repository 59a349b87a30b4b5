//! Fault-injection execution service.
//!
//! The controller only talks to [`FaultService`]. Templates are materialized
//! from a validated experiment here so every backend sends the same document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::status::ExperimentStatus;
use crate::core::types::{ExperimentRecord, ResourceType, ValidationReport};

/// Service-side refusal of a request, carrying the service's error code.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct TemplateRejection {
    pub code: String,
    pub message: String,
    /// Raw diagnostic as returned by the service.
    pub payload: Option<Value>,
}

impl TemplateRejection {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            payload: None,
        }
    }

    /// Status a rejected template creation settles in.
    ///
    /// Rejections are permanent for this attempt; they are never retried.
    pub fn creation_status(&self) -> ExperimentStatus {
        let code = self.code.as_str();
        if code == "ValidationException" {
            ExperimentStatus::TemplateInvalid
        } else if code == "ServiceQuotaExceededException"
            || code.contains("Throttl")
            || code.contains("LimitExceeded")
            || code.contains("Quota")
        {
            ExperimentStatus::ServiceLimit
        } else {
            ExperimentStatus::CreationFailed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("request rejected by fault-injection service: {0}")]
    Rejected(TemplateRejection),
    #[error("fault-injection service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    pub fn payload(&self) -> Option<&Value> {
        match self {
            ServiceError::Rejected(rejection) => rejection.payload.as_ref(),
            ServiceError::Unavailable(_) => None,
        }
    }
}

/// Remote run state as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Initiating,
    Running,
    Stopping,
    Completed,
    Stopped,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn from_service(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(RunState::Pending),
            "initiating" => Some(RunState::Initiating),
            "running" => Some(RunState::Running),
            "stopping" => Some(RunState::Stopping),
            "completed" => Some(RunState::Completed),
            "stopped" => Some(RunState::Stopped),
            "cancelled" => Some(RunState::Cancelled),
            "failed" => Some(RunState::Failed),
            _ => None,
        }
    }

    /// Experiment status for a finished run; `None` while still in progress.
    pub fn terminal_status(&self) -> Option<ExperimentStatus> {
        match self {
            RunState::Completed => Some(ExperimentStatus::Completed),
            RunState::Stopped | RunState::Cancelled => Some(ExperimentStatus::Stopped),
            RunState::Failed => Some(ExperimentStatus::Failed),
            RunState::Pending | RunState::Initiating | RunState::Running | RunState::Stopping => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub state: RunState,
    pub reason: Option<String>,
    /// Raw status document for notes.
    pub payload: Option<Value>,
}

impl RunStatus {
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            reason: None,
            payload: None,
        }
    }
}

/// One concrete target of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTarget {
    pub resource_type: ResourceType,
    pub resource_ids: Vec<String>,
    pub resource_arns: Vec<String>,
    /// Service-side parameters (e.g. pod cluster and namespace).
    pub parameters: BTreeMap<String, String>,
}

/// Everything needed to create an experiment template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRequest {
    pub experiment_id: String,
    /// Idempotency token; unique per creation attempt of one experiment.
    pub client_token: String,
    pub description: String,
    pub role_arn: String,
    pub action_id: String,
    pub action_parameters: BTreeMap<String, String>,
    pub targets: BTreeMap<String, TemplateTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaterializeError {
    #[error("target '{0}' has no validation result")]
    MissingResult(String),
    #[error("target '{target}': resource '{id}' has no ARN")]
    MissingArn { target: String, id: String },
    #[error("target '{0}': pods need a cluster and namespace")]
    PodScope(String),
}

impl TemplateRequest {
    /// Build a template for the matched resources of a valid report.
    ///
    /// `arns` maps resource ids to ARNs for every resolved resource.
    pub fn materialize(
        record: &ExperimentRecord,
        report: &ValidationReport,
        arns: &BTreeMap<String, String>,
        role_arn: &str,
    ) -> Result<Self, MaterializeError> {
        let mut targets = BTreeMap::new();
        for (name, descriptor) in &record.targets {
            let result = report
                .targets
                .get(name)
                .ok_or_else(|| MaterializeError::MissingResult(name.clone()))?;
            let ids = result.matched_resources.clone();
            let mut parameters = BTreeMap::new();
            let mut resource_arns = Vec::new();
            if descriptor.resource_type == ResourceType::EksPod {
                let scope = &descriptor.scope;
                let (Some(cluster), Some(namespace)) = (&scope.cluster, &scope.namespace) else {
                    return Err(MaterializeError::PodScope(name.clone()));
                };
                parameters.insert("clusterIdentifier".to_string(), cluster.clone());
                parameters.insert("namespace".to_string(), namespace.clone());
                parameters.insert("selectorType".to_string(), "podName".to_string());
                parameters.insert("selectorValue".to_string(), ids.join(","));
            } else {
                for id in &ids {
                    let arn = arns.get(id).ok_or_else(|| MaterializeError::MissingArn {
                        target: name.clone(),
                        id: id.clone(),
                    })?;
                    resource_arns.push(arn.clone());
                }
            }
            targets.insert(
                name.clone(),
                TemplateTarget {
                    resource_type: descriptor.resource_type,
                    resource_ids: ids,
                    resource_arns,
                    parameters,
                },
            );
        }
        let description = if record.title.is_empty() {
            format!("chaosctl experiment {}", record.id)
        } else {
            record.title.clone()
        };
        Ok(Self {
            experiment_id: record.id.clone(),
            client_token: format!("{}-{}", record.id, record.transitions.len()),
            description,
            role_arn: role_arn.to_string(),
            action_id: report.action_id.clone(),
            action_parameters: record.action_parameters.clone(),
            targets,
        })
    }

    /// Request body for `fis create-experiment-template --cli-input-json`.
    pub fn to_service_json(&self) -> Value {
        let targets: serde_json::Map<String, Value> = self
            .targets
            .iter()
            .map(|(name, target)| {
                let mut body = json!({
                    "resourceType": target.resource_type.as_str(),
                    "selectionMode": "ALL",
                });
                if !target.resource_arns.is_empty() {
                    body["resourceArns"] = json!(target.resource_arns);
                }
                if !target.parameters.is_empty() {
                    body["parameters"] = json!(target.parameters);
                }
                (name.clone(), body)
            })
            .collect();
        let action_targets: serde_json::Map<String, Value> = self
            .targets
            .iter()
            .map(|(name, target)| {
                (
                    target.resource_type.action_target_key().to_string(),
                    Value::String(name.clone()),
                )
            })
            .collect();
        json!({
            "clientToken": self.client_token,
            "description": self.description,
            "roleArn": self.role_arn,
            "stopConditions": [{ "source": "none" }],
            "targets": targets,
            "actions": {
                "fault": {
                    "actionId": self.action_id,
                    "parameters": self.action_parameters,
                    "targets": action_targets,
                }
            },
            "tags": { "chaosctl:experiment": self.experiment_id },
        })
    }
}

/// External fault-injection service.
pub trait FaultService: Send + Sync {
    /// Create a template; returns the service-assigned template id.
    fn create_template(&self, request: &TemplateRequest) -> Result<String, ServiceError>;
    /// Start a run of `template_id`; returns the service-assigned run id.
    fn start(&self, template_id: &str) -> Result<String, ServiceError>;
    fn stop(&self, run_id: &str) -> Result<RunStatus, ServiceError>;
    fn get_status(&self, run_id: &str) -> Result<RunStatus, ServiceError>;
    /// Execution role published by the deployment, used when none is configured.
    fn exported_role(&self) -> Result<Option<String>, ServiceError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ScopeParameters, SelectionMode, TargetDescriptor};
    use crate::test_support::{draft_record, valid_result};

    fn report(action_id: &str, matched: &[&str]) -> ValidationReport {
        ValidationReport {
            action_id: action_id.to_string(),
            targets: [("main".to_string(), valid_result(matched))].into_iter().collect(),
            substitution: None,
            warnings: Vec::new(),
            fingerprint: "f".to_string(),
        }
    }

    #[test]
    fn rejection_codes_map_to_statuses() {
        let status = |code: &str| TemplateRejection::new(code, "m").creation_status();
        assert_eq!(status("ValidationException"), ExperimentStatus::TemplateInvalid);
        assert_eq!(
            status("ServiceQuotaExceededException"),
            ExperimentStatus::ServiceLimit
        );
        assert_eq!(status("ThrottlingException"), ExperimentStatus::ServiceLimit);
        assert_eq!(status("ConflictException"), ExperimentStatus::CreationFailed);
    }

    #[test]
    fn run_states_map_to_terminal_statuses() {
        assert_eq!(RunState::from_service("COMPLETED"), Some(RunState::Completed));
        assert_eq!(
            RunState::Cancelled.terminal_status(),
            Some(ExperimentStatus::Stopped)
        );
        assert_eq!(RunState::Running.terminal_status(), None);
        assert_eq!(RunState::from_service("exploded"), None);
    }

    #[test]
    fn materialize_uses_arns_of_matched_resources() {
        let record = draft_record(
            "exp-1",
            "aws:rds:failover-db-cluster",
            TargetDescriptor {
                resource_type: ResourceType::RdsCluster,
                selection_mode: SelectionMode::Count { count: 1 },
                scope: ScopeParameters::default(),
            },
        );
        let arns: BTreeMap<String, String> = [
            ("db-1".to_string(), "arn:aws:rds:us-east-1:1:cluster:db-1".to_string()),
            ("db-2".to_string(), "arn:aws:rds:us-east-1:1:cluster:db-2".to_string()),
        ]
        .into_iter()
        .collect();

        let request = TemplateRequest::materialize(
            &record,
            &report("aws:rds:failover-db-cluster", &["db-1"]),
            &arns,
            "arn:aws:iam::1:role/fis",
        )
        .expect("materialize");
        let body = request.to_service_json();
        assert_eq!(
            body["targets"]["main"]["resourceArns"],
            json!(["arn:aws:rds:us-east-1:1:cluster:db-1"])
        );
        assert_eq!(body["actions"]["fault"]["targets"]["Clusters"], json!("main"));
        assert_eq!(body["roleArn"], json!("arn:aws:iam::1:role/fis"));
    }

    #[test]
    fn materialize_requires_arns_and_pod_scope() {
        let record = draft_record(
            "exp-1",
            "aws:eks:pod-delete",
            TargetDescriptor {
                resource_type: ResourceType::EksPod,
                selection_mode: SelectionMode::All,
                scope: ScopeParameters::default(),
            },
        );
        let err = TemplateRequest::materialize(
            &record,
            &report("aws:eks:pod-delete", &["web-1"]),
            &BTreeMap::new(),
            "role",
        )
        .expect_err("pod scope");
        assert_eq!(err, MaterializeError::PodScope("main".to_string()));

        let mut record = record;
        record.targets.values_mut().for_each(|t| {
            t.resource_type = ResourceType::Ec2Instance;
        });
        let err = TemplateRequest::materialize(
            &record,
            &report("aws:ec2:stop-instances", &["i-1"]),
            &BTreeMap::new(),
            "role",
        )
        .expect_err("missing arn");
        assert_eq!(
            err,
            MaterializeError::MissingArn {
                target: "main".to_string(),
                id: "i-1".to_string(),
            }
        );
    }
}
