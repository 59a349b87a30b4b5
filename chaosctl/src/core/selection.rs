//! Selection-mode evaluation over eligible resources.

use std::collections::{BTreeMap, HashSet};

use crate::core::types::{
    Eligibility, RejectionKind, SelectionMode, ValidationResult, ValidationStatus,
};

/// Everything the evaluator needs about one target, in resolver order.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    /// Resources returned by the resolver before tag filtering.
    pub discovered_count: u32,
    /// Resources removed by the tag filter.
    pub tag_rejections: Vec<Eligibility>,
    /// Precondition decisions for every resource that passed the tag filter.
    pub decisions: Vec<Eligibility>,
    /// Resolver and filter diagnostics carried into the result.
    pub diagnostics: Vec<String>,
}

/// Number of resources a percent quantifier requires: `ceil(p * k / 100)`.
pub fn percent_required(percent: u32, eligible: u32) -> u32 {
    let numerator = u64::from(percent) * u64::from(eligible);
    numerator.div_ceil(100) as u32
}

/// Check the quantifier against eligible candidates and pick concrete targets.
///
/// Matched resources are taken in resolver order, so reruns against an
/// unchanged inventory select the same ids.
pub fn evaluate_selection(mode: &SelectionMode, candidates: Candidates) -> ValidationResult {
    match mode {
        SelectionMode::Explicit { ids } => evaluate_explicit(mode, ids, candidates),
        _ => evaluate_quantifier(mode, candidates),
    }
}

fn evaluate_quantifier(mode: &SelectionMode, candidates: Candidates) -> ValidationResult {
    let eligible: Vec<&str> = candidates
        .decisions
        .iter()
        .filter(|d| d.eligible)
        .map(|d| d.id.as_str())
        .collect();
    let found = candidates.decisions.len() as u32;
    let k = eligible.len() as u32;

    let (required, valid, satisfiable_by_found) = match mode {
        SelectionMode::Count { count } => (*count, k >= *count, found >= *count),
        SelectionMode::Percent { percent } => {
            let required = percent_required(*percent, k);
            (required, required >= 1 && k >= required, found >= 1)
        }
        SelectionMode::All => (k.max(1), k >= 1, found >= 1),
        SelectionMode::Explicit { .. } => unreachable!("explicit handled separately"),
    };

    let matched = if valid {
        eligible
            .iter()
            .take(required as usize)
            .map(|id| id.to_string())
            .collect()
    } else {
        Vec::new()
    };

    let status = if valid {
        ValidationStatus::Valid
    } else if satisfiable_by_found {
        ineligibility_status(candidates.decisions.iter())
    } else {
        ValidationStatus::InsufficientResources
    };

    finish(mode, status, matched, required, found, k, candidates, Vec::new())
}

fn evaluate_explicit(mode: &SelectionMode, ids: &[String], candidates: Candidates) -> ValidationResult {
    let mut seen = HashSet::new();
    let listed: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();

    let mut missing = Vec::new();
    let mut listed_decisions = Vec::new();
    for id in &listed {
        if let Some(decision) = candidates.decisions.iter().find(|d| &d.id == *id) {
            listed_decisions.push(decision);
        } else if let Some(tagged) = candidates.tag_rejections.iter().find(|d| &d.id == *id) {
            listed_decisions.push(tagged);
        } else {
            missing.push(Eligibility::rejected(
                id.as_str(),
                RejectionKind::Missing,
                "not found in scope",
            ));
        }
    }

    let required = listed.len() as u32;
    let found = listed_decisions
        .iter()
        .filter(|d| d.kind != RejectionKind::Tag)
        .count() as u32;
    let eligible = listed_decisions.iter().filter(|d| d.eligible).count() as u32;
    let valid = missing.is_empty() && eligible == required;

    let status = if valid {
        ValidationStatus::Valid
    } else if !missing.is_empty() || found < required {
        ValidationStatus::InsufficientResources
    } else {
        ineligibility_status(listed_decisions.iter().copied())
    };
    let matched = if valid {
        listed.iter().map(|id| id.to_string()).collect()
    } else {
        Vec::new()
    };

    finish(mode, status, matched, required, found, eligible, candidates, missing)
}

/// Topology rejections dominate state rejections.
fn ineligibility_status<'a>(decisions: impl Iterator<Item = &'a Eligibility>) -> ValidationStatus {
    let mut any_topology = false;
    for decision in decisions {
        if decision.kind == RejectionKind::Topology {
            any_topology = true;
        }
    }
    if any_topology {
        ValidationStatus::TopologyViolation
    } else {
        ValidationStatus::InvalidState
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    mode: &SelectionMode,
    status: ValidationStatus,
    matched: Vec<String>,
    required: u32,
    found: u32,
    eligible: u32,
    candidates: Candidates,
    missing: Vec<Eligibility>,
) -> ValidationResult {
    let mut reasons = candidates.decisions;
    reasons.extend(candidates.tag_rejections);
    reasons.sort_by(|a, b| a.id.cmp(&b.id));
    reasons.extend(missing);

    let mut rejections = BTreeMap::new();
    for reason in reasons.iter().filter(|r| !r.eligible) {
        *rejections.entry(reason.kind).or_insert(0) += 1;
    }

    ValidationResult {
        status,
        selection_mode: mode.clone(),
        matched_resources: matched,
        required_count: required,
        discovered_count: candidates.discovered_count,
        found_count: found,
        eligible_count: eligible,
        reasons,
        rejections,
        diagnostics: candidates.diagnostics,
    }
}
