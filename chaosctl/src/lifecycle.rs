//! Experiment lifecycle controller.
//!
//! Every status change is a compare-and-set against the persisted status, so
//! concurrent controllers cannot overwrite each other. Non-idempotent external
//! calls (template creation, run start) are issued only after the persisted
//! status has been confirmed or claimed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::backoff::{BackoffPolicy, next_sleep, remaining_budget};
use crate::core::invariants::validate_submission;
use crate::core::preconditions::{FallbackTable, RuleRegistry};
use crate::core::status::ExperimentStatus;
use crate::core::tag_filter::WorkloadTagFilter;
use crate::core::types::{
    ExperimentRecord, Note, NoteCounts, NoteLevel, RejectionKind, Transition, ValidationReport,
    ValidationResult, ValidationStatus,
};
use crate::io::clock::Clock;
use crate::io::config::{ControllerConfig, DEFAULT_REGION};
use crate::io::fault_service::{FaultService, RunStatus, ServiceError, TemplateRequest};
use crate::io::inventory::{DiscoveryError, InventoryProvider};
use crate::io::store::{CasOutcome, ExperimentStore, StoreError};
use crate::io::tags::TagSource;
use crate::validate::{Pipeline, PipelineOutput};

/// Attempts at persisting a started run's id before the run is abandoned.
const RUN_ID_WRITE_ATTEMPTS: u32 = 3;

const ROLE_REMEDIATION: &str = "pass --role-arn, set CHAOS_FIS_ROLE_ARN, set execution_role_arn in .chaos/config.toml, or publish the role as the CloudFormation export named by aws.role_export";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("experiment '{0}' not found")]
    NotFound(String),
    #[error("experiment '{id}': transition {from} -> {to} is not allowed")]
    ForbiddenTransition {
        id: String,
        from: ExperimentStatus,
        to: ExperimentStatus,
    },
    #[error("experiment '{id}': expected status {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: ExperimentStatus,
        actual: ExperimentStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("invalid experiment:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
}

/// Shared cancellation flag for in-flight operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Dry-run validation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Valid(ValidationReport),
    Invalid(ValidationReport),
    /// The inventory could not answer; `status` is where `create` would land.
    Unavailable {
        status: ExperimentStatus,
        detail: String,
    },
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub region: String,
    pub role_arn: Option<String>,
    pub page_size: u32,
    pub fallbacks: FallbackTable,
    pub poll: BackoffPolicy,
    pub deadline: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            role_arn: None,
            page_size: 100,
            fallbacks: FallbackTable::default(),
            poll: BackoffPolicy::default(),
            deadline: Duration::from_secs(60 * 60),
        }
    }
}

impl ControllerSettings {
    pub fn from_config(cfg: &ControllerConfig, region: String, role_arn: Option<String>) -> Self {
        Self {
            region,
            role_arn,
            page_size: cfg.inventory.page_size,
            fallbacks: FallbackTable::new(cfg.fallback_actions.clone()),
            poll: cfg.poll.policy(),
            deadline: cfg.poll.deadline(),
        }
    }
}

/// External collaborators the controller drives.
#[derive(Clone, Copy)]
pub struct Ports<'a> {
    pub store: &'a dyn ExperimentStore,
    pub inventory: &'a dyn InventoryProvider,
    pub service: &'a dyn FaultService,
    pub tags: &'a dyn TagSource,
    pub clock: &'a dyn Clock,
}

pub struct Controller<'a> {
    ports: Ports<'a>,
    registry: RuleRegistry,
    settings: ControllerSettings,
}

impl<'a> Controller<'a> {
    pub fn new(ports: Ports<'a>, settings: ControllerSettings) -> Self {
        Self {
            ports,
            registry: RuleRegistry::builtin(),
            settings,
        }
    }

    pub fn with_registry(mut self, registry: RuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Insert a producer-supplied draft.
    #[instrument(skip_all, fields(id = %record.id))]
    pub fn submit(&self, record: &ExperimentRecord) -> Result<ExperimentRecord, ControllerError> {
        let errors = validate_submission(record);
        if !errors.is_empty() {
            return Err(ControllerError::Invalid(errors));
        }
        self.ports.store.insert(record)?;
        Ok(record.clone())
    }

    pub fn show(&self, id: &str) -> Result<ExperimentRecord, ControllerError> {
        self.load(id)
    }

    pub fn list(
        &self,
        status: Option<ExperimentStatus>,
    ) -> Result<Vec<ExperimentRecord>, ControllerError> {
        let records = self.ports.store.list()?;
        Ok(match status {
            Some(status) => records.into_iter().filter(|r| r.status == status).collect(),
            None => records,
        })
    }

    /// Run the validation pipeline without persisting anything.
    #[instrument(skip_all, fields(id = %id))]
    pub fn check(&self, id: &str) -> Result<CheckOutcome, ControllerError> {
        let record = self.load(id)?;
        let tags = self.tag_snapshot()?;
        Ok(match self.run_pipeline(&record, &tags) {
            Ok(output) if output.report.is_valid() => CheckOutcome::Valid(output.report),
            Ok(output) => CheckOutcome::Invalid(output.report),
            Err(err) => CheckOutcome::Unavailable {
                status: discovery_status(&err),
                detail: err.to_string(),
            },
        })
    }

    /// Validate a draft and materialize its template.
    ///
    /// Returns the record in its new persisted state. Cancellation before the
    /// template call puts the record back in draft, and so does any error
    /// raised after the record was claimed.
    #[instrument(skip_all, fields(id = %id))]
    pub fn create(&self, id: &str, cancel: &CancelToken) -> Result<ExperimentRecord, ControllerError> {
        let draft = self.load(id)?;
        if draft.status != ExperimentStatus::Draft {
            return Err(forbidden(&draft, ExperimentStatus::Validating));
        }
        let tags = self.tag_snapshot()?;
        let validating = self.advance(
            &draft,
            ExperimentStatus::Validating,
            "create requested",
            vec![Note::new(
                ExperimentStatus::Validating,
                NoteLevel::Info,
                format!("validating {} target(s) for {}", draft.targets.len(), draft.action_id),
            )],
            |_| {},
        )?;
        match self.validate_claimed(&validating, &tags, cancel) {
            Err(err @ ControllerError::Conflict { .. }) => Err(err),
            Err(err) => self.release_claim(&validating, err),
            ok => ok,
        }
    }

    fn validate_claimed(
        &self,
        validating: &ExperimentRecord,
        tags: &WorkloadTagFilter,
        cancel: &CancelToken,
    ) -> Result<ExperimentRecord, ControllerError> {
        let id = validating.id.as_str();
        if cancel.is_cancelled() {
            return self.cancel_validation(validating);
        }

        let output = match self.run_pipeline(validating, tags) {
            Ok(output) => output,
            Err(err) => {
                let status = discovery_status(&err);
                let note = Note::new(status, NoteLevel::Error, err.to_string())
                    .with_remediation(discovery_remediation(&err));
                return self.advance(validating, status, "inventory query failed", vec![note], |_| {});
            }
        };
        if cancel.is_cancelled() {
            return self.cancel_validation(validating);
        }

        let report = output.report.clone();
        let mut notes = validation_notes(&report);
        if !report.is_valid() {
            return self.advance(
                validating,
                ExperimentStatus::ValidationFailed,
                "validation failed",
                notes,
                |r| r.validation = Some(report.clone()),
            );
        }

        let request = match self.materialize(validating, &output) {
            Ok(request) => request,
            Err(note) => {
                notes.push(note);
                return self.advance(
                    validating,
                    ExperimentStatus::CreationFailed,
                    "template could not be built",
                    notes,
                    |r| r.validation = Some(report.clone()),
                );
            }
        };

        // The template call is not idempotent; confirm nobody moved the record.
        let persisted = self.load(id)?;
        if persisted.status != ExperimentStatus::Validating {
            return Err(ControllerError::Conflict {
                id: id.to_string(),
                expected: ExperimentStatus::Validating,
                actual: persisted.status,
            });
        }
        if cancel.is_cancelled() {
            return self.cancel_validation(validating);
        }

        match self.ports.service.create_template(&request) {
            Ok(template_id) => {
                let matched = report.matched_ids();
                notes.push(
                    Note::new(
                        ExperimentStatus::Created,
                        NoteLevel::Info,
                        format!(
                            "template {template_id} created for {} resource(s) with {}",
                            matched.len(),
                            report.action_id
                        ),
                    )
                    .with_resources(matched)
                    .with_counts(total_counts(&report)),
                );
                self.advance(
                    validating,
                    ExperimentStatus::Created,
                    "template created",
                    notes,
                    |r| {
                        r.template_id = Some(template_id.clone());
                        r.validation = Some(report.clone());
                    },
                )
            }
            Err(err) => {
                let status = match &err {
                    ServiceError::Rejected(rejection) => rejection.creation_status(),
                    ServiceError::Unavailable(_) => ExperimentStatus::CreationFailed,
                };
                warn!(%status, error = %err, "template creation rejected");
                notes.push(service_note(status, &err).with_remediation(creation_remediation(status)));
                self.advance(validating, status, "template rejected", notes, |r| {
                    r.validation = Some(report.clone());
                })
            }
        }
    }

    /// Start a created experiment; with `wait`, poll until it settles.
    #[instrument(skip_all, fields(id = %id, wait = wait))]
    pub fn execute(
        &self,
        id: &str,
        wait: bool,
        cancel: &CancelToken,
    ) -> Result<ExperimentRecord, ControllerError> {
        let created = self.load(id)?;
        if created.status != ExperimentStatus::Created {
            return Err(forbidden(&created, ExperimentStatus::Running));
        }
        let template_id = created.template_id.clone().ok_or_else(|| {
            ControllerError::Invalid(vec![format!("{id}: created without a template id")])
        })?;

        // Claim the record before the start call so a second executor loses the CAS.
        let running = self.advance(
            &created,
            ExperimentStatus::Running,
            "execute requested",
            vec![Note::new(
                ExperimentStatus::Running,
                NoteLevel::Info,
                format!("starting template {template_id}"),
            )],
            |r| r.started_at = Some(Utc::now()),
        )?;

        let run_id = match self.ports.service.start(&template_id) {
            Ok(run_id) => run_id,
            Err(err) => {
                let note = service_note(ExperimentStatus::Failed, &err)
                    .with_remediation("inspect the template and execution role, then retry");
                return self.advance(&running, ExperimentStatus::Failed, "start failed", vec![note], |r| {
                    r.ended_at = Some(Utc::now());
                });
            }
        };
        let started = match self.record_run_id(&running, &run_id) {
            Ok(started) => started,
            Err(err) => return self.abandon_run(&running, &run_id, err),
        };

        if !wait {
            return Ok(started);
        }
        self.poll_until_settled(started, &run_id, cancel)
    }

    /// Poll once; settle the record if the run has finished.
    #[instrument(skip_all, fields(id = %id))]
    pub fn refresh(&self, id: &str) -> Result<ExperimentRecord, ControllerError> {
        let record = self.load(id)?;
        if record.status != ExperimentStatus::Running {
            debug!(status = %record.status, "not running; nothing to refresh");
            return Ok(record);
        }
        let run_id = running_run_id(&record)?;
        let status = self.ports.service.get_status(&run_id)?;
        match status.state.terminal_status() {
            Some(terminal) => self.settle(&record, &run_id, terminal, status),
            None => Ok(record),
        }
    }

    /// Stop a running experiment.
    #[instrument(skip_all, fields(id = %id))]
    pub fn stop(&self, id: &str) -> Result<ExperimentRecord, ControllerError> {
        let record = self.load(id)?;
        if record.status != ExperimentStatus::Running {
            return Err(forbidden(&record, ExperimentStatus::Stopped));
        }
        let Some(run_id) = record.run_id.clone() else {
            let note = Note::new(
                ExperimentStatus::Stopped,
                NoteLevel::Error,
                "no run id was recorded for this execution",
            )
            .with_remediation("list runs with `aws fis list-experiments` and stop any left active");
            return self.advance(&record, ExperimentStatus::Stopped, "stop requested", vec![note], |r| {
                r.ended_at = Some(Utc::now());
            });
        };
        let status = self.ports.service.stop(&run_id)?;
        let mut note = Note::new(
            ExperimentStatus::Stopped,
            NoteLevel::Warning,
            format!("run {run_id} stopped on request"),
        );
        if let Some(payload) = status.payload {
            note = note.with_payload(payload);
        }
        self.advance(&record, ExperimentStatus::Stopped, "stop requested", vec![note], |r| {
            r.ended_at = Some(Utc::now());
        })
    }

    /// Explicit external reset of a settled experiment back to draft.
    ///
    /// Notes, validation, and remote ids are cleared; transition history stays.
    #[instrument(skip_all, fields(id = %id))]
    pub fn retry(&self, id: &str) -> Result<ExperimentRecord, ControllerError> {
        let record = self.load(id)?;
        if !record.status.can_retry() {
            return Err(forbidden(&record, ExperimentStatus::Draft));
        }
        let now = Utc::now();
        let mut next = record.clone();
        next.transitions.push(Transition {
            from: record.status,
            to: ExperimentStatus::Draft,
            at: now,
            reason: "retry requested".to_string(),
        });
        next.status = ExperimentStatus::Draft;
        next.notes.clear();
        next.validation = None;
        next.template_id = None;
        next.run_id = None;
        next.started_at = None;
        next.ended_at = None;
        next.updated_at = now;
        self.write(record.status, &next)?;
        Ok(next)
    }

    fn load(&self, id: &str) -> Result<ExperimentRecord, ControllerError> {
        self.ports
            .store
            .get(id)?
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))
    }

    fn tag_snapshot(&self) -> Result<WorkloadTagFilter, ControllerError> {
        self.ports
            .tags
            .snapshot()
            .map_err(|err| ControllerError::Config(format!("{err:#}")))
    }

    fn run_pipeline(
        &self,
        record: &ExperimentRecord,
        tags: &WorkloadTagFilter,
    ) -> Result<PipelineOutput, DiscoveryError> {
        let pipeline = Pipeline::new(
            self.ports.inventory,
            &self.registry,
            &self.settings.fallbacks,
            self.settings.region.as_str(),
            self.settings.page_size,
        );
        pipeline.run(record, tags)
    }

    /// Return a claimed record to draft after an error, then report the error.
    fn release_claim(
        &self,
        validating: &ExperimentRecord,
        err: ControllerError,
    ) -> Result<ExperimentRecord, ControllerError> {
        warn!(error = %err, "create failed after claiming the record; returning to draft");
        let note = Note::new(ExperimentStatus::Draft, NoteLevel::Error, format!("create aborted: {err}"))
            .with_remediation("resolve the error, then create again");
        if let Err(release) = self.advance(validating, ExperimentStatus::Draft, "create aborted", vec![note], |_| {}) {
            warn!(error = %release, "could not return the record to draft");
        }
        Err(err)
    }

    /// Persist the run id, retrying store errors.
    fn record_run_id(
        &self,
        running: &ExperimentRecord,
        run_id: &str,
    ) -> Result<ExperimentRecord, ControllerError> {
        let mut started = running.clone();
        started.run_id = Some(run_id.to_string());
        started.notes.push(Note::new(
            ExperimentStatus::Running,
            NoteLevel::Info,
            format!("run {run_id} started"),
        ));
        let mut attempt = 1;
        loop {
            started.updated_at = Utc::now();
            match self.write(ExperimentStatus::Running, &started) {
                Ok(()) => return Ok(started),
                Err(ControllerError::Store(err)) if attempt < RUN_ID_WRITE_ATTEMPTS => {
                    warn!(attempt, error = %err, run_id, "run id write failed; retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stop a run whose id could not be persisted and record it as failed.
    fn abandon_run(
        &self,
        running: &ExperimentRecord,
        run_id: &str,
        err: ControllerError,
    ) -> Result<ExperimentRecord, ControllerError> {
        warn!(error = %err, run_id, "run id not persisted; stopping the run");
        let stopped = match self.ports.service.stop(run_id) {
            Ok(_) => "stop requested".to_string(),
            Err(stop) => {
                warn!(error = %stop, run_id, "stop of unrecorded run failed");
                format!("stop failed: {stop}")
            }
        };
        let note = Note::new(
            ExperimentStatus::Failed,
            NoteLevel::Error,
            format!("run {run_id} started but its id could not be persisted: {err}"),
        )
        .with_payload(json!({ "run_id": run_id, "stop": stopped }))
        .with_remediation(format!("confirm run {run_id} is no longer active, then retry"));
        match self.advance(running, ExperimentStatus::Failed, "run id not persisted", vec![note], |r| {
            r.run_id = Some(run_id.to_string());
            r.ended_at = Some(Utc::now());
        }) {
            Ok(failed) => Ok(failed),
            Err(second) => {
                warn!(error = %second, run_id, "could not record the abandoned run");
                Err(err)
            }
        }
    }

    fn materialize(
        &self,
        record: &ExperimentRecord,
        output: &PipelineOutput,
    ) -> Result<TemplateRequest, Note> {
        let role_arn = self.execution_role()?;
        TemplateRequest::materialize(record, &output.report, &output.arns, &role_arn).map_err(|err| {
            Note::new(ExperimentStatus::CreationFailed, NoteLevel::Error, err.to_string())
                .with_remediation("the inventory must report an ARN for every matched resource")
        })
    }

    /// Configured role first, then the deployment's exported role.
    fn execution_role(&self) -> Result<String, Note> {
        if let Some(role) = &self.settings.role_arn {
            return Ok(role.clone());
        }
        match self.ports.service.exported_role() {
            Ok(Some(role)) => {
                debug!(role = %role, "using exported execution role");
                Ok(role)
            }
            Ok(None) => Err(Note::new(
                ExperimentStatus::CreationFailed,
                NoteLevel::Error,
                "no execution role configured for the fault-injection service",
            )
            .with_remediation(ROLE_REMEDIATION)),
            Err(err) => Err(service_note(ExperimentStatus::CreationFailed, &err).with_remediation(ROLE_REMEDIATION)),
        }
    }

    fn cancel_validation(&self, validating: &ExperimentRecord) -> Result<ExperimentRecord, ControllerError> {
        warn!("validation cancelled; returning to draft");
        self.advance(
            validating,
            ExperimentStatus::Draft,
            "cancelled",
            vec![Note::new(
                ExperimentStatus::Draft,
                NoteLevel::Warning,
                "validation cancelled before a template was created",
            )],
            |_| {},
        )
    }

    fn poll_until_settled(
        &self,
        record: ExperimentRecord,
        run_id: &str,
        cancel: &CancelToken,
    ) -> Result<ExperimentRecord, ControllerError> {
        let clock = self.ports.clock;
        let deadline = clock.now() + self.settings.deadline;
        let mut rng = rand::thread_rng();
        let mut attempt: u32 = 0;
        let mut last_error: Option<ServiceError> = None;
        loop {
            if cancel.is_cancelled() {
                return self.stop_cancelled(&record, run_id);
            }
            match self.ports.service.get_status(run_id) {
                Ok(status) => {
                    if let Some(terminal) = status.state.terminal_status() {
                        return self.settle(&record, run_id, terminal, status);
                    }
                    debug!(attempt, state = ?status.state, "run in progress");
                }
                Err(err) => {
                    warn!(attempt, error = %err, "status poll failed");
                    last_error = Some(err);
                }
            }
            let Some(remaining) = remaining_budget(deadline, clock.now()) else {
                return self.time_out(&record, run_id, last_error);
            };
            let sample: f64 = rng.gen_range(-1.0..=1.0);
            clock.sleep(next_sleep(&self.settings.poll, attempt, sample, remaining));
            attempt = attempt.saturating_add(1);
        }
    }

    fn settle(
        &self,
        record: &ExperimentRecord,
        run_id: &str,
        terminal: ExperimentStatus,
        status: RunStatus,
    ) -> Result<ExperimentRecord, ControllerError> {
        let level = match terminal {
            ExperimentStatus::Completed => NoteLevel::Info,
            ExperimentStatus::Stopped => NoteLevel::Warning,
            _ => NoteLevel::Error,
        };
        let mut message = format!("run {run_id} finished as {terminal}");
        if let Some(reason) = &status.reason {
            message.push_str(": ");
            message.push_str(reason);
        }
        let mut note = Note::new(terminal, level, message);
        if let Some(payload) = status.payload {
            note = note.with_payload(payload);
        }
        self.advance(record, terminal, "run settled", vec![note], |r| {
            r.ended_at = Some(Utc::now());
        })
    }

    fn stop_cancelled(&self, record: &ExperimentRecord, run_id: &str) -> Result<ExperimentRecord, ControllerError> {
        let note = match self.ports.service.stop(run_id) {
            Ok(status) => {
                let note = Note::new(
                    ExperimentStatus::Stopped,
                    NoteLevel::Warning,
                    format!("run {run_id} stopped after cancellation"),
                );
                match status.payload {
                    Some(payload) => note.with_payload(payload),
                    None => note,
                }
            }
            Err(err) => {
                warn!(error = %err, "stop after cancellation failed");
                service_note(ExperimentStatus::Stopped, &err)
                    .with_remediation(format!("confirm run {run_id} is no longer active"))
            }
        };
        self.advance(record, ExperimentStatus::Stopped, "cancelled", vec![note], |r| {
            r.ended_at = Some(Utc::now());
        })
    }

    fn time_out(
        &self,
        record: &ExperimentRecord,
        run_id: &str,
        last_error: Option<ServiceError>,
    ) -> Result<ExperimentRecord, ControllerError> {
        warn!(run_id, "run did not settle before the deadline");
        let mut note = Note::new(
            ExperimentStatus::Timeout,
            NoteLevel::Error,
            format!(
                "no terminal status for run {run_id} within {}s; the remote run may still be in flight",
                self.settings.deadline.as_secs()
            ),
        )
        .with_remediation(format!(
            "check the run with `aws fis get-experiment --id {run_id}` and stop it if needed"
        ));
        if let Some(payload) = last_error.as_ref().and_then(ServiceError::payload) {
            note = note.with_payload(payload.clone());
        }
        self.advance(record, ExperimentStatus::Timeout, "deadline exceeded", vec![note], |r| {
            r.ended_at = Some(Utc::now());
        })
    }

    /// Apply one graph edge and persist it with compare-and-set.
    fn advance(
        &self,
        current: &ExperimentRecord,
        to: ExperimentStatus,
        reason: &str,
        notes: Vec<Note>,
        edit: impl FnOnce(&mut ExperimentRecord),
    ) -> Result<ExperimentRecord, ControllerError> {
        if !current.status.can_transition_to(to) {
            return Err(forbidden(current, to));
        }
        let now = Utc::now();
        let mut next = current.clone();
        edit(&mut next);
        next.transitions.push(Transition {
            from: current.status,
            to,
            at: now,
            reason: reason.to_string(),
        });
        next.status = to;
        next.notes.extend(notes);
        next.updated_at = now;
        self.write(current.status, &next)?;
        debug!(from = %current.status, %to, reason, "transition applied");
        Ok(next)
    }

    fn write(&self, expected: ExperimentStatus, next: &ExperimentRecord) -> Result<(), ControllerError> {
        match self.ports.store.compare_and_set(expected, next)? {
            CasOutcome::Applied => Ok(()),
            CasOutcome::Conflict { actual } => Err(ControllerError::Conflict {
                id: next.id.clone(),
                expected,
                actual,
            }),
            CasOutcome::Missing => Err(ControllerError::NotFound(next.id.clone())),
        }
    }
}

fn forbidden(record: &ExperimentRecord, to: ExperimentStatus) -> ControllerError {
    ControllerError::ForbiddenTransition {
        id: record.id.clone(),
        from: record.status,
        to,
    }
}

fn running_run_id(record: &ExperimentRecord) -> Result<String, ControllerError> {
    record.run_id.clone().ok_or_else(|| {
        ControllerError::Invalid(vec![format!(
            "{}: running without a run id; use stop to settle it",
            record.id
        )])
    })
}

pub fn discovery_status(err: &DiscoveryError) -> ExperimentStatus {
    match err {
        DiscoveryError::AccessDenied(_) => ExperimentStatus::PermissionError,
        DiscoveryError::ScopeNotFound(_) => ExperimentStatus::ValidationFailed,
        DiscoveryError::Unreachable(_) | DiscoveryError::Malformed(_) => {
            ExperimentStatus::ResourceUnavailable
        }
    }
}

fn discovery_remediation(err: &DiscoveryError) -> &'static str {
    match err {
        DiscoveryError::AccessDenied(_) => {
            "grant the caller read-only describe/list access for this resource type"
        }
        DiscoveryError::ScopeNotFound(_) => "check the cluster and namespace in the target scope",
        DiscoveryError::Unreachable(_) => "check network access and credentials, then create again",
        DiscoveryError::Malformed(_) => "the inventory returned an unexpected response; create again",
    }
}

fn creation_remediation(status: ExperimentStatus) -> &'static str {
    match status {
        ExperimentStatus::TemplateInvalid => "fix the action parameters or targets, then retry",
        ExperimentStatus::ServiceLimit => "wait for running experiments to finish or raise the quota, then retry",
        _ => "inspect the service error, then retry",
    }
}

fn service_note(status: ExperimentStatus, err: &ServiceError) -> Note {
    let note = Note::new(status, NoteLevel::Error, err.to_string());
    match err.payload() {
        Some(payload) => note.with_payload(payload.clone()),
        None => note,
    }
}

fn total_counts(report: &ValidationReport) -> NoteCounts {
    report.targets.values().fold(NoteCounts::default(), |acc, result| NoteCounts {
        required: acc.required + result.required_count,
        found: acc.found + result.found_count,
        eligible: acc.eligible + result.eligible_count,
    })
}

/// One note per target plus warnings and any fallback decision.
fn validation_notes(report: &ValidationReport) -> Vec<Note> {
    let status = if report.is_valid() {
        ExperimentStatus::Validating
    } else {
        ExperimentStatus::ValidationFailed
    };
    let mut notes: Vec<Note> = report
        .warnings
        .iter()
        .map(|warning| Note::new(status, NoteLevel::Warning, warning.clone()))
        .collect();
    if let Some(substitution) = &report.substitution {
        let verb = if substitution.applied { "substituted" } else { "not substituted" };
        notes.push(Note::new(
            status,
            NoteLevel::Policy,
            format!(
                "fallback {} -> {} {verb}: {}",
                substitution.from_action, substitution.to_action, substitution.reason
            ),
        ));
    }
    for (name, result) in &report.targets {
        notes.push(target_note(status, name, result));
    }
    notes
}

fn target_note(status: ExperimentStatus, name: &str, result: &ValidationResult) -> Note {
    let counts = NoteCounts {
        required: result.required_count,
        found: result.found_count,
        eligible: result.eligible_count,
    };
    if result.is_valid() {
        return Note::new(
            status,
            NoteLevel::Info,
            format!("target '{name}': {} matched", result.shortfall()),
        )
        .with_resources(result.matched_resources.clone())
        .with_counts(counts);
    }
    let rejected: Vec<_> = result.reasons.iter().filter(|r| !r.eligible).collect();
    let mut message = format!(
        "target '{name}' {}: {}",
        result.status.as_str(),
        result.shortfall()
    );
    for diagnostic in &result.diagnostics {
        message.push_str("; ");
        message.push_str(diagnostic);
    }
    for reason in &rejected {
        message.push_str(&format!("; {}: {}", reason.id, reason.reason));
    }
    let remediation = match result.status {
        ValidationStatus::TopologyViolation => {
            "target larger groups or declare a fallback action in fallback_actions"
        }
        ValidationStatus::InvalidState => "bring the resources to the required state or choose another action",
        _ if result.rejections.contains_key(&RejectionKind::Tag) => {
            "check workload_tags and target scope tags against the resources' tags"
        }
        _ => "widen the target scope or lower the selection quantifier",
    };
    Note::new(status, NoteLevel::Error, message)
        .with_resources(rejected.iter().map(|r| r.id.clone()).collect())
        .with_counts(counts)
        .with_remediation(remediation)
}
