//! Controller-level lifecycle scenarios.
//!
//! Each test wires the controller to an in-memory store, a scripted inventory,
//! a scripted fault service, and a manual clock, then drives it through the
//! public operations only.

use std::time::Duration;

use chaosctl::batch::{create_all, execute_top};
use chaosctl::core::backoff::BackoffPolicy;
use chaosctl::core::preconditions::FallbackTable;
use chaosctl::core::status::ExperimentStatus;
use chaosctl::core::tag_filter::WorkloadTagFilter;
use chaosctl::core::types::{
    ExperimentRecord, NoteLevel, ResourceType, ScopeParameters, SelectionMode, TargetDescriptor,
};
use chaosctl::io::fault_service::{RunState, RunStatus, ServiceError, TemplateRejection};
use chaosctl::io::init::ChaosPaths;
use chaosctl::io::inventory::DiscoveryError;
use chaosctl::io::journal::read_entries;
use chaosctl::io::store::{ExperimentStore, FileStore, MemoryStore};
use chaosctl::io::tags::{EnvOrConfigTags, StaticTags, WORKLOAD_TAGS_ENV};
use chaosctl::lifecycle::{
    CancelToken, CheckOutcome, Controller, ControllerError, ControllerSettings, Ports,
};
use chaosctl::test_support::{
    FlakyStore, ManualClock, ScriptedFaultService, ScriptedInventory, ServiceCall, draft_record,
    instance, percent_target, rds_cluster, tagged_instance,
};
use serde_json::json;

struct Harness<S: ExperimentStore> {
    store: S,
    inventory: ScriptedInventory,
    service: ScriptedFaultService,
    tags: StaticTags,
    clock: ManualClock,
}

impl Harness<MemoryStore> {
    fn new(inventory: ScriptedInventory) -> Self {
        Harness::with_store(MemoryStore::new(), inventory)
    }
}

impl<S: ExperimentStore> Harness<S> {
    fn with_store(store: S, inventory: ScriptedInventory) -> Self {
        Self {
            store,
            inventory,
            service: ScriptedFaultService::new(),
            tags: StaticTags::default(),
            clock: ManualClock::new(),
        }
    }

    fn controller(&self, settings: ControllerSettings) -> Controller<'_> {
        Controller::new(
            Ports {
                store: &self.store,
                inventory: &self.inventory,
                service: &self.service,
                tags: &self.tags,
                clock: &self.clock,
            },
            settings,
        )
    }

    fn submit(&self, record: &ExperimentRecord) {
        self.controller(settings()).submit(record).expect("submit");
    }
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        role_arn: Some("arn:aws:iam::1:role/fis".to_string()),
        poll: BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
            multiplier: 2.0,
            jitter_ratio: 0.0,
        },
        deadline: Duration::from_secs(10),
        ..ControllerSettings::default()
    }
}

fn stop_instances(id: &str) -> ExperimentRecord {
    draft_record(id, "aws:ec2:stop-instances", percent_target(50))
}

fn failover_record() -> ExperimentRecord {
    draft_record(
        "exp-failover",
        "aws:rds:failover-db-cluster",
        TargetDescriptor {
            resource_type: ResourceType::RdsCluster,
            selection_mode: SelectionMode::Count { count: 1 },
            scope: ScopeParameters::default(),
        },
    )
}

fn statuses(record: &ExperimentRecord) -> Vec<ExperimentStatus> {
    record.transitions.iter().map(|t| t.to).collect()
}

/// Four instances, two tagged env=test; PERCENT(50) scoped to env=test picks
/// exactly one, the lowest tagged id, and materializes it by ARN.
#[test]
fn percent_target_resolves_to_lowest_tagged_instance() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![
        instance("i-1"),
        tagged_instance("i-4", &[("env", "test")]),
        instance("i-3"),
        tagged_instance("i-2", &[("env", "test")]),
    ]));
    let mut descriptor = percent_target(50);
    descriptor
        .scope
        .tags
        .insert("env".to_string(), "test".to_string());
    harness.submit(&draft_record("exp-1", "aws:ec2:stop-instances", descriptor));

    let record = harness
        .controller(settings())
        .create("exp-1", &CancelToken::new())
        .expect("create");

    assert_eq!(record.status, ExperimentStatus::Created);
    assert_eq!(record.template_id.as_deref(), Some("EXT1"));
    let report = record.validation.expect("report");
    let result = &report.targets["main"];
    assert_eq!(result.matched_resources, vec!["i-2".to_string()]);
    assert_eq!(result.found_count, 2);
    assert_eq!(result.eligible_count, 2);
    assert_eq!(result.required_count, 1);

    let request = &harness.service.requests()[0];
    assert_eq!(
        request.targets["main"].resource_arns,
        vec!["arn:aws:ec2:us-east-1:1:instance/i-2".to_string()]
    );
    assert_eq!(request.client_token, "exp-1-1");
}

/// Full happy path: create, execute with polling, settle as completed.
#[test]
fn execute_polls_until_the_run_completes() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![
        instance("i-1"),
        instance("i-2"),
    ]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");

    harness
        .service
        .push_states(&[RunState::Initiating, RunState::Running, RunState::Completed]);
    let record = controller
        .execute("exp-1", true, &CancelToken::new())
        .expect("execute");

    assert_eq!(record.status, ExperimentStatus::Completed);
    assert_eq!(record.run_id.as_deref(), Some("EXP2"));
    assert!(record.started_at.is_some());
    assert!(record.ended_at.is_some());
    assert_eq!(
        statuses(&record),
        vec![
            ExperimentStatus::Validating,
            ExperimentStatus::Created,
            ExperimentStatus::Running,
            ExperimentStatus::Completed,
        ]
    );
    assert_eq!(
        harness.clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    let persisted = controller.show("exp-1").expect("show");
    assert_eq!(persisted, record);
}

/// A completed experiment never goes back to validating on its own; only an
/// explicit retry resets it.
#[test]
fn completed_experiment_cannot_be_revalidated_without_retry() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");
    harness.service.push_states(&[RunState::Completed]);
    controller
        .execute("exp-1", true, &CancelToken::new())
        .expect("execute");

    let err = controller
        .create("exp-1", &CancelToken::new())
        .expect_err("revalidate");
    assert!(matches!(
        err,
        ControllerError::ForbiddenTransition {
            from: ExperimentStatus::Completed,
            to: ExperimentStatus::Validating,
            ..
        }
    ));

    let reset = controller.retry("exp-1").expect("retry");
    assert_eq!(reset.status, ExperimentStatus::Draft);
    assert!(reset.notes.is_empty());
    assert!(reset.template_id.is_none());
    assert_eq!(reset.transitions.len(), 5);

    let again = controller
        .create("exp-1", &CancelToken::new())
        .expect("create after retry");
    assert_eq!(again.status, ExperimentStatus::Created);
}

#[test]
fn retry_is_rejected_while_running() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");
    controller
        .execute("exp-1", false, &CancelToken::new())
        .expect("execute");

    let err = controller.retry("exp-1").expect_err("running");
    assert!(matches!(err, ControllerError::ForbiddenTransition { .. }));
}

/// Failover against a single-member cluster fails validation with the exact
/// member shortfall and no substitution.
#[test]
fn single_member_failover_fails_without_fallback() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![rds_cluster(
        "db-1", 1,
    )]));
    harness.submit(&failover_record());

    let record = harness
        .controller(settings())
        .create("exp-failover", &CancelToken::new())
        .expect("create");

    assert_eq!(record.status, ExperimentStatus::ValidationFailed);
    let failure = record
        .notes
        .iter()
        .find(|note| note.level == NoteLevel::Error)
        .expect("error note");
    assert!(failure.message.contains("requires >= 2 members, found 1"));
    assert_eq!(failure.resource_ids, vec!["db-1".to_string()]);
    let counts = failure.counts.as_ref().expect("counts");
    assert_eq!((counts.required, counts.found, counts.eligible), (1, 1, 0));
    assert!(failure.remediation.is_some());
    assert!(record.notes.iter().all(|note| note.level != NoteLevel::Policy));
    assert!(harness.service.calls().is_empty());
}

/// With a declared fallback the substitution happens and is recorded as a
/// policy note; the template uses the fallback action.
#[test]
fn declared_fallback_is_recorded_as_policy() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![rds_cluster(
        "db-1", 1,
    )]));
    harness.submit(&failover_record());
    let settings = ControllerSettings {
        fallbacks: FallbackTable::new(
            [(
                "aws:rds:failover-db-cluster".to_string(),
                "aws:rds:reboot-db-cluster".to_string(),
            )]
            .into_iter()
            .collect(),
        ),
        ..settings()
    };

    let record = harness
        .controller(settings)
        .create("exp-failover", &CancelToken::new())
        .expect("create");

    assert_eq!(record.status, ExperimentStatus::Created);
    assert_eq!(record.action_id, "aws:rds:failover-db-cluster");
    let policy = record
        .notes
        .iter()
        .find(|note| note.level == NoteLevel::Policy)
        .expect("policy note");
    assert!(policy.message.contains("aws:rds:reboot-db-cluster"));
    assert_eq!(
        harness.service.requests()[0].action_id,
        "aws:rds:reboot-db-cluster"
    );
}

#[test]
fn template_rejections_are_classified_and_not_retried() {
    let cases = [
        ("ValidationException", ExperimentStatus::TemplateInvalid),
        ("ServiceQuotaExceededException", ExperimentStatus::ServiceLimit),
        ("ConflictException", ExperimentStatus::CreationFailed),
    ];
    for (code, expected) in cases {
        let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
        harness.submit(&stop_instances("exp-1"));
        let mut rejection = TemplateRejection::new(code, "rejected by service");
        rejection.payload = Some(json!({ "code": code }));
        harness
            .service
            .push_create(Err(ServiceError::Rejected(rejection)));

        let record = harness
            .controller(settings())
            .create("exp-1", &CancelToken::new())
            .expect("create");

        assert_eq!(record.status, expected, "{code}");
        let last = record.last_note().expect("note");
        assert_eq!(last.payload, Some(json!({ "code": code })));
        assert_eq!(harness.service.calls().len(), 1, "{code}: single attempt");
    }
}

#[test]
fn missing_execution_role_fails_creation_with_remediation() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let settings = ControllerSettings {
        role_arn: None,
        ..settings()
    };

    let record = harness
        .controller(settings)
        .create("exp-1", &CancelToken::new())
        .expect("create");

    assert_eq!(record.status, ExperimentStatus::CreationFailed);
    let note = record.last_note().expect("note");
    assert!(
        note.remediation
            .as_deref()
            .is_some_and(|hint| hint.contains("--role-arn"))
    );
    assert!(harness.service.calls().is_empty());
}

#[test]
fn exported_role_is_used_when_none_is_configured() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    harness
        .service
        .set_exported_role(Ok("arn:aws:iam::1:role/exported".to_string()));
    let settings = ControllerSettings {
        role_arn: None,
        ..settings()
    };

    let record = harness
        .controller(settings)
        .create("exp-1", &CancelToken::new())
        .expect("create");

    assert_eq!(record.status, ExperimentStatus::Created);
    assert_eq!(
        harness.service.requests()[0].role_arn,
        "arn:aws:iam::1:role/exported"
    );
}

#[test]
fn failed_role_lookup_fails_creation() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    harness.service.set_exported_role(Err(ServiceError::Unavailable(
        "list-exports timed out".to_string(),
    )));
    let settings = ControllerSettings {
        role_arn: None,
        ..settings()
    };

    let record = harness
        .controller(settings)
        .create("exp-1", &CancelToken::new())
        .expect("create");

    assert_eq!(record.status, ExperimentStatus::CreationFailed);
    let note = record.last_note().expect("note");
    assert!(note.message.contains("list-exports timed out"));
    assert!(harness.service.calls().is_empty());
}

#[test]
fn inventory_errors_map_to_distinct_statuses() {
    let cases = [
        (
            DiscoveryError::AccessDenied("ec2:DescribeInstances".to_string()),
            ExperimentStatus::PermissionError,
        ),
        (
            DiscoveryError::Unreachable("connect timeout".to_string()),
            ExperimentStatus::ResourceUnavailable,
        ),
    ];
    for (err, expected) in cases {
        let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
        harness.submit(&stop_instances("exp-1"));
        harness.inventory.fail_with(err);

        let record = harness
            .controller(settings())
            .create("exp-1", &CancelToken::new())
            .expect("create");
        assert_eq!(record.status, expected);
        assert!(record.last_note().expect("note").remediation.is_some());
    }
}

#[test]
fn cancelled_creation_returns_to_draft() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let cancel = CancelToken::new();
    cancel.cancel();

    let record = harness
        .controller(settings())
        .create("exp-1", &cancel)
        .expect("create");

    assert_eq!(record.status, ExperimentStatus::Draft);
    assert_eq!(
        statuses(&record),
        vec![ExperimentStatus::Validating, ExperimentStatus::Draft]
    );
    assert!(harness.service.calls().is_empty());
}

/// A run that never settles times out at the deadline, distinct from failed.
#[test]
fn polling_past_the_deadline_times_out() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");

    let record = controller
        .execute("exp-1", true, &CancelToken::new())
        .expect("execute");

    assert_eq!(record.status, ExperimentStatus::Timeout);
    assert_eq!(harness.clock.slept(), Duration::from_secs(10));
    assert!(
        harness
            .clock
            .sleeps()
            .iter()
            .all(|sleep| *sleep <= Duration::from_secs(4))
    );
    let note = record.last_note().expect("note");
    assert!(note.message.contains("may still be in flight"));
}

#[test]
fn cancellation_while_polling_stops_the_run() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");
    let cancel = CancelToken::new();
    cancel.cancel();

    let record = controller.execute("exp-1", true, &cancel).expect("execute");

    assert_eq!(record.status, ExperimentStatus::Stopped);
    assert!(
        harness
            .service
            .calls()
            .contains(&ServiceCall::Stop("EXP2".to_string()))
    );
}

#[test]
fn start_failure_keeps_the_service_detail() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");
    harness
        .service
        .push_start(Err(ServiceError::Unavailable("endpoint throttled".to_string())));

    let record = controller
        .execute("exp-1", true, &CancelToken::new())
        .expect("execute");
    assert_eq!(record.status, ExperimentStatus::Failed);
    assert!(
        record
            .last_note()
            .expect("note")
            .message
            .contains("endpoint throttled")
    );
}

#[test]
fn second_execute_is_rejected() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");
    controller
        .execute("exp-1", false, &CancelToken::new())
        .expect("execute");

    let err = controller
        .execute("exp-1", false, &CancelToken::new())
        .expect_err("already running");
    assert!(matches!(
        err,
        ControllerError::ForbiddenTransition {
            from: ExperimentStatus::Running,
            ..
        }
    ));
    let starts = harness
        .service
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ServiceCall::Start(_)))
        .count();
    assert_eq!(starts, 1);
}

#[test]
fn refresh_applies_a_reported_terminal_state_verbatim() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");
    controller
        .execute("exp-1", false, &CancelToken::new())
        .expect("execute");

    harness.service.push_states(&[RunState::Running]);
    let still = controller.refresh("exp-1").expect("refresh");
    assert_eq!(still.status, ExperimentStatus::Running);

    let payload = json!({ "state": { "status": "failed", "reason": "instance vanished" } });
    harness.service.push_status(Ok(RunStatus {
        state: RunState::Failed,
        reason: Some("instance vanished".to_string()),
        payload: Some(payload.clone()),
    }));
    let record = controller.refresh("exp-1").expect("refresh");
    assert_eq!(record.status, ExperimentStatus::Failed);
    let note = record.last_note().expect("note");
    assert!(note.message.contains("instance vanished"));
    assert_eq!(note.payload, Some(payload));
}

#[test]
fn stop_moves_running_to_stopped() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());

    let err = controller.stop("exp-1").expect_err("draft");
    assert!(matches!(err, ControllerError::ForbiddenTransition { .. }));

    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");
    controller
        .execute("exp-1", false, &CancelToken::new())
        .expect("execute");
    let record = controller.stop("exp-1").expect("stop");
    assert_eq!(record.status, ExperimentStatus::Stopped);
    assert!(record.ended_at.is_some());
}

#[test]
fn check_does_not_persist() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());

    let outcome = controller.check("exp-1").expect("check");
    assert!(matches!(outcome, CheckOutcome::Valid(_)));
    let record = controller.show("exp-1").expect("show");
    assert_eq!(record.status, ExperimentStatus::Draft);
    assert!(record.transitions.is_empty());
}

#[test]
fn workload_tags_snapshot_applies_to_validation() {
    let mut harness = Harness::new(ScriptedInventory::from_resources(vec![
        instance("i-1"),
        instance("i-2"),
    ]));
    harness.tags = StaticTags(WorkloadTagFilter::from_pairs([("env", "test")]));
    harness.submit(&stop_instances("exp-1"));

    let record = harness
        .controller(settings())
        .create("exp-1", &CancelToken::new())
        .expect("create");
    assert_eq!(record.status, ExperimentStatus::ValidationFailed);
    let note = record
        .notes
        .iter()
        .find(|note| note.level == NoteLevel::Error)
        .expect("error note");
    assert!(note.message.contains("missing tag env=test"));
}

#[test]
fn malformed_workload_tags_leave_the_draft_untouched() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    harness.submit(&stop_instances("exp-1"));
    let tags = EnvOrConfigTags::new(WorkloadTagFilter::default(), |key: &str| {
        (key == WORKLOAD_TAGS_ENV).then(|| "Environment".to_string())
    });
    let controller = Controller::new(
        Ports {
            store: &harness.store,
            inventory: &harness.inventory,
            service: &harness.service,
            tags: &tags,
            clock: &harness.clock,
        },
        settings(),
    );

    let err = controller
        .create("exp-1", &CancelToken::new())
        .expect_err("bad tags");
    assert!(matches!(&err, ControllerError::Config(detail) if detail.contains(WORKLOAD_TAGS_ENV)));
    let record = controller.show("exp-1").expect("show");
    assert_eq!(record.status, ExperimentStatus::Draft);
    assert!(record.transitions.is_empty());
    assert!(harness.service.calls().is_empty());

    let record = harness
        .controller(settings())
        .create("exp-1", &CancelToken::new())
        .expect("create");
    assert_eq!(record.status, ExperimentStatus::Created);
}

/// Reads: 1 loads the draft, 2 confirms the claim before the template call.
#[test]
fn store_error_after_claim_returns_the_record_to_draft() {
    let harness = Harness::with_store(
        FlakyStore::new().fail_gets([2]),
        ScriptedInventory::from_resources(vec![instance("i-1")]),
    );
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());

    let err = controller
        .create("exp-1", &CancelToken::new())
        .expect_err("read failure");
    assert!(matches!(err, ControllerError::Store(_)));
    assert!(harness.service.calls().is_empty());

    let record = controller.show("exp-1").expect("show");
    assert_eq!(record.status, ExperimentStatus::Draft);
    assert_eq!(
        statuses(&record),
        vec![ExperimentStatus::Validating, ExperimentStatus::Draft]
    );
    let note = record.last_note().expect("note");
    assert_eq!(note.level, NoteLevel::Error);
    assert!(note.message.contains("create aborted"));

    let record = controller
        .create("exp-1", &CancelToken::new())
        .expect("create");
    assert_eq!(record.status, ExperimentStatus::Created);
}

/// Writes: 1 validating, 2 created, 3 running claim, 4 onward the run id.
#[test]
fn run_id_write_is_retried() {
    let harness = Harness::with_store(
        FlakyStore::new().fail_writes([4]),
        ScriptedInventory::from_resources(vec![instance("i-1")]),
    );
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");

    let record = controller
        .execute("exp-1", false, &CancelToken::new())
        .expect("execute");
    assert_eq!(record.status, ExperimentStatus::Running);
    assert_eq!(record.run_id.as_deref(), Some("EXP2"));
    assert_eq!(harness.store.writes(), 5);
    let persisted = controller.show("exp-1").expect("show");
    assert_eq!(persisted.run_id.as_deref(), Some("EXP2"));
}

#[test]
fn unpersisted_run_is_stopped_and_failed() {
    let harness = Harness::with_store(
        FlakyStore::new().fail_writes([4, 5, 6]),
        ScriptedInventory::from_resources(vec![instance("i-1")]),
    );
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");

    let record = controller
        .execute("exp-1", true, &CancelToken::new())
        .expect("execute");

    assert_eq!(record.status, ExperimentStatus::Failed);
    assert_eq!(record.run_id.as_deref(), Some("EXP2"));
    assert!(record.ended_at.is_some());
    let note = record.last_note().expect("note");
    assert!(note.message.contains("EXP2"));
    assert_eq!(
        note.payload.as_ref().and_then(|p| p["run_id"].as_str()),
        Some("EXP2")
    );
    assert_eq!(
        harness.service.calls().last(),
        Some(&ServiceCall::Stop("EXP2".to_string()))
    );
    assert_eq!(controller.show("exp-1").expect("show"), record);
}

#[test]
fn stop_settles_a_run_without_a_recorded_id() {
    let harness = Harness::with_store(
        FlakyStore::new().fail_writes([4, 5, 6, 7]),
        ScriptedInventory::from_resources(vec![instance("i-1")]),
    );
    harness.submit(&stop_instances("exp-1"));
    let controller = harness.controller(settings());
    controller
        .create("exp-1", &CancelToken::new())
        .expect("create");

    let err = controller
        .execute("exp-1", false, &CancelToken::new())
        .expect_err("store down");
    assert!(matches!(err, ControllerError::Store(_)));
    let stuck = controller.show("exp-1").expect("show");
    assert_eq!(stuck.status, ExperimentStatus::Running);
    assert!(stuck.run_id.is_none());
    assert!(matches!(
        controller.refresh("exp-1"),
        Err(ControllerError::Invalid(_))
    ));
    let calls_before = harness.service.calls().len();

    let record = controller.stop("exp-1").expect("stop");
    assert_eq!(record.status, ExperimentStatus::Stopped);
    assert!(record.ended_at.is_some());
    let note = record.last_note().expect("note");
    assert_eq!(note.level, NoteLevel::Error);
    assert!(note.remediation.is_some());
    assert_eq!(harness.service.calls().len(), calls_before);
}

#[test]
fn unknown_experiment_is_not_found() {
    let harness = Harness::new(ScriptedInventory::default());
    let err = harness
        .controller(settings())
        .create("exp-missing", &CancelToken::new())
        .expect_err("missing");
    assert!(matches!(err, ControllerError::NotFound(_)));
}

#[test]
fn file_store_journals_every_transition() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = ChaosPaths::new(temp.path());
    let harness = Harness::with_store(
        FileStore::new(paths.clone()),
        ScriptedInventory::from_resources(vec![instance("i-1")]),
    );
    harness.submit(&stop_instances("exp-1"));
    harness
        .controller(settings())
        .create("exp-1", &CancelToken::new())
        .expect("create");

    let entries = read_entries(&paths.journal_path("exp-1")).expect("journal");
    let to: Vec<_> = entries.iter().map(|entry| entry.to).collect();
    assert_eq!(
        to,
        vec![ExperimentStatus::Validating, ExperimentStatus::Created]
    );
}

#[test]
fn batch_creates_drafts_and_executes_the_top_n() {
    let harness = Harness::new(ScriptedInventory::from_resources(vec![instance("i-1")]));
    for id in ["exp-c", "exp-a", "exp-b"] {
        harness.submit(&stop_instances(id));
    }
    let controller = harness.controller(settings());

    let created = create_all(&controller, 2, &CancelToken::new()).expect("create all");
    assert_eq!(created.len(), 3);
    assert!(
        created
            .iter()
            .all(|item| item.outcome == Ok(ExperimentStatus::Created))
    );

    let started = execute_top(&controller, 2, false, 2, &CancelToken::new()).expect("execute");
    let ids: Vec<_> = started.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, vec!["exp-a", "exp-b"]);
    assert_eq!(
        controller
            .list(Some(ExperimentStatus::Created))
            .expect("list")
            .len(),
        1
    );
}
