//! Loading experiment submissions from the upstream producer.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::invariants::validate_submission;
use crate::core::types::{ExperimentRecord, Submission};
use crate::io::init::EXPERIMENT_SCHEMA;

/// Read a submission file and turn it into a draft record.
pub fn load_submission(path: &Path) -> Result<ExperimentRecord> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read submission {}", path.display()))?;
    parse_submission(&raw).with_context(|| format!("load submission {}", path.display()))
}

/// Schema conformance, then semantic invariants.
pub fn parse_submission(raw: &str) -> Result<ExperimentRecord> {
    let instance: Value = serde_json::from_str(raw).context("parse submission json")?;
    let schema: Value =
        serde_json::from_str(EXPERIMENT_SCHEMA).context("parse experiment schema")?;
    validate_schema(&instance, &schema)?;
    let submission: Submission =
        serde_json::from_value(instance).context("parse submission as v1 struct")?;
    let record = submission.into_draft();
    let errors = validate_submission(&record);
    if !errors.is_empty() {
        bail!("invariant violations:\n- {}", errors.join("\n- "));
    }
    Ok(record)
}

fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
