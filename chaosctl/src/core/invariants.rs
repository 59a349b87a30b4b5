//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::status::ExperimentStatus;
use crate::core::types::{ExperimentRecord, ValidationResult};

/// Check a record handed over by the upstream producer:
/// - id is non-empty and `[A-Za-z0-9._-]` only
/// - at least one target, each with a satisfiable quantifier
/// - action id looks like `<provider>:<service>:<action>`
/// - status is `draft`
pub fn validate_submission(record: &ExperimentRecord) -> Vec<String> {
    let mut errors = Vec::new();

    if let Err(err) = validate_id(&record.id) {
        errors.push(err);
    }
    if record.status != ExperimentStatus::Draft {
        errors.push(format!(
            "{}: submitted records must be draft, got {}",
            record.id, record.status
        ));
    }
    if record.action_id.split(':').filter(|part| !part.is_empty()).count() < 3 {
        errors.push(format!(
            "{}: action_id '{}' must look like provider:service:action",
            record.id, record.action_id
        ));
    }
    if record.targets.is_empty() {
        errors.push(format!("{}: at least one target is required", record.id));
    }
    for (name, target) in &record.targets {
        if name.trim().is_empty() {
            errors.push(format!("{}: target names must not be empty", record.id));
        }
        if let Err(err) = target.selection_mode.check() {
            errors.push(format!("{}/{}: {}", record.id, name, err));
        }
    }

    errors
}

/// Validate that an id is safe to use as a file name.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(format!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    if id.starts_with('.') {
        return Err(format!("id must not start with '.' (got '{id}')"));
    }
    Ok(())
}

/// Fields owned by the upstream producer must survive every controller write.
///
/// Returns a list of stable error messages (empty on success).
pub fn check_producer_fields_unchanged(prev: &ExperimentRecord, next: &ExperimentRecord) -> Vec<String> {
    let mut errors = Vec::new();
    if prev.id != next.id {
        errors.push(format!("id changed from '{}' to '{}'", prev.id, next.id));
    }
    if prev.hypothesis_id != next.hypothesis_id {
        errors.push(format!("{}: hypothesis_id changed", prev.id));
    }
    if prev.targets != next.targets {
        errors.push(format!("{}: target descriptors changed", prev.id));
    }
    if prev.action_id != next.action_id {
        errors.push(format!("{}: action_id changed", prev.id));
    }
    if prev.action_parameters != next.action_parameters {
        errors.push(format!("{}: action_parameters changed", prev.id));
    }
    if prev.created_at != next.created_at {
        errors.push(format!("{}: created_at changed", prev.id));
    }
    errors
}

/// `matched_resources` must be a duplicate-free subset of eligible resources,
/// and counts must agree with the reasons list.
pub fn check_result_consistency(result: &ValidationResult) -> Vec<String> {
    let mut errors = Vec::new();
    let eligible: HashSet<&str> = result
        .reasons
        .iter()
        .filter(|r| r.eligible)
        .map(|r| r.id.as_str())
        .collect();

    let mut seen = HashSet::new();
    for id in &result.matched_resources {
        if !seen.insert(id.as_str()) {
            errors.push(format!("matched resource '{id}' listed twice"));
        }
        if !eligible.contains(id.as_str()) {
            errors.push(format!("matched resource '{id}' is not eligible"));
        }
    }
    if result.is_valid() && result.matched_resources.is_empty() {
        errors.push("valid result has no matched resources".to_string());
    }
    if !result.is_valid() && !result.matched_resources.is_empty() {
        errors.push("invalid result must not carry matched resources".to_string());
    }
    if result.eligible_count > result.found_count && result.found_count > 0 {
        errors.push(format!(
            "eligible_count {} exceeds found_count {}",
            result.eligible_count, result.found_count
        ));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Eligibility, SelectionMode};
    use crate::test_support::{draft_record, percent_target};

    #[test]
    fn valid_submission_has_no_errors() {
        let record = draft_record("exp-1", "aws:ec2:stop-instances", percent_target(50));
        assert!(validate_submission(&record).is_empty());
    }

    #[test]
    fn submission_errors_are_reported_together() {
        let mut record = draft_record("bad/id", "stop", percent_target(50));
        record.status = ExperimentStatus::Created;
        record.targets.values_mut().for_each(|t| {
            t.selection_mode = SelectionMode::Count { count: 0 };
        });

        let errors = validate_submission(&record);
        assert!(errors.iter().any(|e| e.contains("[A-Za-z0-9._-]")));
        assert!(errors.iter().any(|e| e.contains("must be draft")));
        assert!(errors.iter().any(|e| e.contains("provider:service:action")));
        assert!(errors.iter().any(|e| e.contains("COUNT must be >= 1")));
    }

    #[test]
    fn producer_fields_are_immutable() {
        let prev = draft_record("exp-1", "aws:ec2:stop-instances", percent_target(50));
        let mut next = prev.clone();
        next.status = ExperimentStatus::Validating;
        assert!(check_producer_fields_unchanged(&prev, &next).is_empty());

        next.action_id = "aws:ec2:terminate-instances".to_string();
        next.targets.clear();
        let errors = check_producer_fields_unchanged(&prev, &next);
        assert_eq!(
            errors,
            vec![
                "exp-1: target descriptors changed".to_string(),
                "exp-1: action_id changed".to_string(),
            ]
        );
    }

    #[test]
    fn matched_resources_must_be_eligible() {
        let result = ValidationResult {
            status: crate::core::types::ValidationStatus::Valid,
            selection_mode: SelectionMode::All,
            matched_resources: vec!["i-1".to_string(), "i-2".to_string()],
            required_count: 1,
            discovered_count: 2,
            found_count: 2,
            eligible_count: 1,
            reasons: vec![
                Eligibility::eligible("i-1", "ok"),
                Eligibility::rejected("i-2", crate::core::types::RejectionKind::State, "stopped"),
            ],
            rejections: Default::default(),
            diagnostics: Vec::new(),
        };
        assert_eq!(
            check_result_consistency(&result),
            vec!["matched resource 'i-2' is not eligible".to_string()]
        );
    }
}
