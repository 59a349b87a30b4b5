//! Validation pipeline for one experiment.
//!
//! Strict sequence per target: resolve, tag filter, preconditions, selection.
//! Every run re-queries the inventory; earlier reports are never reused.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::core::invariants::check_result_consistency;
use crate::core::preconditions::{AggregateContext, FallbackTable, RuleRegistry};
use crate::core::selection::{Candidates, evaluate_selection};
use crate::core::tag_filter::{WorkloadTagFilter, apply_tag_filter, missing_tag_reason};
use crate::core::types::{
    Eligibility, ExperimentRecord, RejectionKind, ResourceRecord, Substitution, TargetDescriptor,
    ValidationReport, ValidationResult,
};
use crate::io::inventory::{DiscoveryError, InventoryProvider};
use crate::resolve::{InventoryCache, Resolver};

/// Report plus the id-to-ARN map needed to materialize a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub report: ValidationReport,
    pub arns: BTreeMap<String, String>,
}

/// One target after resolution and tag filtering; preconditions are applied
/// per action so a fallback can be re-evaluated without touching the inventory.
struct Filtered {
    descriptor: TargetDescriptor,
    discovered_count: u32,
    kept: Vec<ResourceRecord>,
    tag_rejections: Vec<Eligibility>,
    aggregate: AggregateContext,
    diagnostics: Vec<String>,
}

pub struct Pipeline<'a> {
    inventory: &'a dyn InventoryProvider,
    registry: &'a RuleRegistry,
    fallbacks: &'a FallbackTable,
    region: String,
    page_size: u32,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        inventory: &'a dyn InventoryProvider,
        registry: &'a RuleRegistry,
        fallbacks: &'a FallbackTable,
        region: impl Into<String>,
        page_size: u32,
    ) -> Self {
        Self {
            inventory,
            registry,
            fallbacks,
            region: region.into(),
            page_size,
        }
    }

    /// Validate every target of `record` against a tag snapshot.
    #[instrument(skip_all, fields(id = %record.id, action = %record.action_id))]
    pub fn run(
        &self,
        record: &ExperimentRecord,
        tags: &WorkloadTagFilter,
    ) -> Result<PipelineOutput, DiscoveryError> {
        let resolver = Resolver::new(self.inventory, self.region.as_str(), self.page_size);
        let mut cache = InventoryCache::new();
        let mut filtered = BTreeMap::new();
        let mut arns = BTreeMap::new();
        for (name, descriptor) in &record.targets {
            let resolution = resolver.resolve(descriptor, &mut cache)?;
            for resource in &resolution.resources {
                if let Some(arn) = &resource.arn {
                    arns.insert(resource.id.clone(), arn.clone());
                }
            }
            let mut diagnostics: Vec<String> = resolution.diagnostic.into_iter().collect();
            let aggregate = AggregateContext::from_resources(&resolution.resources);
            let discovered_count = resolution.resources.len() as u32;
            let (kept, tag_rejections) =
                filter_by_tags(resolution.resources, tags, descriptor, &mut diagnostics);
            debug!(
                target = %name,
                discovered = discovered_count,
                kept = kept.len(),
                "tag filter applied"
            );
            filtered.insert(
                name.clone(),
                Filtered {
                    descriptor: descriptor.clone(),
                    discovered_count,
                    kept,
                    tag_rejections,
                    aggregate,
                    diagnostics,
                },
            );
        }

        let (mut targets, mut warnings) = self.evaluate(&record.action_id, &filtered);
        let mut action_id = record.action_id.clone();
        let mut substitution = None;
        let all_valid = !targets.is_empty() && targets.values().all(ValidationResult::is_valid);
        if !all_valid && let Some(fallback) = self.fallbacks.fallback_for(&record.action_id) {
            let decision = self.try_fallback(&record.action_id, fallback, &filtered);
            if let Some((fallback_targets, fallback_warnings)) = decision.1 {
                warn!(from = %record.action_id, to = %fallback, "fallback action substituted");
                targets = fallback_targets;
                warnings = fallback_warnings;
                action_id = fallback.to_string();
            }
            substitution = Some(decision.0);
        }

        for (name, result) in &targets {
            for violation in check_result_consistency(result) {
                warn!(target = %name, %violation, "inconsistent validation result");
                warnings.push(format!("{name}: {violation}"));
            }
        }

        let fingerprint = fingerprint(&action_id, &targets);
        Ok(PipelineOutput {
            report: ValidationReport {
                action_id,
                targets,
                substitution,
                warnings,
                fingerprint,
            },
            arns,
        })
    }

    fn evaluate(
        &self,
        action_id: &str,
        filtered: &BTreeMap<String, Filtered>,
    ) -> (BTreeMap<String, ValidationResult>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut targets = BTreeMap::new();
        for (name, target) in filtered {
            let outcome = self
                .registry
                .evaluate(action_id, &target.kept, &target.aggregate);
            if let Some(warning) = outcome.warning
                && !warnings.contains(&warning)
            {
                warnings.push(warning);
            }
            let result = evaluate_selection(
                &target.descriptor.selection_mode,
                Candidates {
                    discovered_count: target.discovered_count,
                    tag_rejections: target.tag_rejections.clone(),
                    decisions: outcome.decisions,
                    diagnostics: target.diagnostics.clone(),
                },
            );
            targets.insert(name.clone(), result);
        }
        (targets, warnings)
    }

    /// Returns the decision record and, when the fallback satisfies every
    /// target, its results.
    #[allow(clippy::type_complexity)]
    fn try_fallback(
        &self,
        primary: &str,
        fallback: &str,
        filtered: &BTreeMap<String, Filtered>,
    ) -> (
        Substitution,
        Option<(BTreeMap<String, ValidationResult>, Vec<String>)>,
    ) {
        let rejected = |reason: String| Substitution {
            from_action: primary.to_string(),
            to_action: fallback.to_string(),
            applied: false,
            reason,
        };
        if let Some(unsupported) = filtered.values().find(|target| {
            self.registry.supports(fallback, target.descriptor.resource_type) == Some(false)
        }) {
            return (
                rejected(format!(
                    "fallback {fallback} does not target {}",
                    unsupported.descriptor.resource_type
                )),
                None,
            );
        }
        let (targets, warnings) = self.evaluate(fallback, filtered);
        let unsatisfied: Vec<&str> = targets
            .iter()
            .filter(|(_, result)| !result.is_valid())
            .map(|(name, _)| name.as_str())
            .collect();
        if !unsatisfied.is_empty() {
            return (
                rejected(format!(
                    "fallback {fallback} also leaves {} unsatisfied",
                    unsatisfied.join(", ")
                )),
                None,
            );
        }
        (
            Substitution {
                from_action: primary.to_string(),
                to_action: fallback.to_string(),
                applied: true,
                reason: format!(
                    "{primary} left targets unsatisfied; declared fallback {fallback} satisfies all"
                ),
            },
            Some((targets, warnings)),
        )
    }
}

fn filter_by_tags(
    resources: Vec<ResourceRecord>,
    workload: &WorkloadTagFilter,
    descriptor: &TargetDescriptor,
    diagnostics: &mut Vec<String>,
) -> (Vec<ResourceRecord>, Vec<Eligibility>) {
    match workload.merged_with(&descriptor.scope.tags) {
        Ok(filter) => {
            let (kept, removed) = apply_tag_filter(resources, &filter);
            let rejections = removed
                .iter()
                .map(|resource| {
                    Eligibility::rejected(
                        &resource.id,
                        RejectionKind::Tag,
                        missing_tag_reason(&filter, resource),
                    )
                })
                .collect();
            (kept, rejections)
        }
        Err(conflicts) => {
            let reason = format!(
                "workload tags and target scope require different values for {}",
                conflicts.join(", ")
            );
            diagnostics.push(reason.clone());
            let rejections = resources
                .iter()
                .map(|resource| Eligibility::rejected(&resource.id, RejectionKind::Tag, &reason))
                .collect();
            (Vec::new(), rejections)
        }
    }
}

/// Digest of the evaluated action, statuses, and matched sets.
fn fingerprint(action_id: &str, targets: &BTreeMap<String, ValidationResult>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action_id.as_bytes());
    for (name, result) in targets {
        hasher.update(b"\n");
        hasher.update(name.as_bytes());
        hasher.update(b"\t");
        hasher.update(result.status.as_str().as_bytes());
        for id in &result.matched_resources {
            hasher.update(b"\t");
            hasher.update(id.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}
