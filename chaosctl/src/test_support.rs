//! Test-only builders and scripted fakes for the inventory, fault service, store, and clock.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::core::status::ExperimentStatus;
use crate::core::types::{
    Eligibility, ExperimentRecord, ResourceRecord, ResourceState, ResourceType, ScopeParameters,
    SelectionMode, TargetDescriptor, Topology, ValidationResult, ValidationStatus,
};
use crate::io::clock::Clock;
use crate::io::fault_service::{
    FaultService, RunState, RunStatus, ServiceError, TemplateRequest,
};
use crate::io::inventory::{
    DiscoveryError, FixtureInventory, InventoryPage, InventoryProvider, InventoryQuery,
};
use crate::io::store::{CasOutcome, ExperimentStore, MemoryStore, StoreError};

/// Running EC2 instance with a deterministic ARN and no tags.
pub fn instance(id: &str) -> ResourceRecord {
    ResourceRecord {
        id: id.to_string(),
        arn: Some(format!("arn:aws:ec2:us-east-1:1:instance/{id}")),
        resource_type: ResourceType::Ec2Instance,
        state: ResourceState::Running,
        tags: BTreeMap::new(),
        topology: Topology::default(),
    }
}

/// Running EC2 instance carrying the given tags.
pub fn tagged_instance(id: &str, tags: &[(&str, &str)]) -> ResourceRecord {
    let mut record = instance(id);
    record.tags = tags
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    record
}

/// Available Aurora cluster reporting `members` instances.
pub fn rds_cluster(id: &str, members: u32) -> ResourceRecord {
    ResourceRecord {
        id: id.to_string(),
        arn: Some(format!("arn:aws:rds:us-east-1:1:cluster:{id}")),
        resource_type: ResourceType::RdsCluster,
        state: ResourceState::Available,
        tags: BTreeMap::new(),
        topology: Topology {
            group_member_count: Some(members),
            ..Topology::default()
        },
    }
}

pub fn percent_target(percent: u32) -> TargetDescriptor {
    TargetDescriptor {
        resource_type: ResourceType::Ec2Instance,
        selection_mode: SelectionMode::Percent { percent },
        scope: ScopeParameters::default(),
    }
}

/// Draft record with a single target named `main`.
pub fn draft_record(id: &str, action_id: &str, descriptor: TargetDescriptor) -> ExperimentRecord {
    ExperimentRecord::draft(
        id,
        action_id,
        [("main".to_string(), descriptor)].into_iter().collect(),
    )
}

/// Valid `COUNT(n)` result matching exactly `ids`.
pub fn valid_result(ids: &[&str]) -> ValidationResult {
    let n = ids.len() as u32;
    ValidationResult {
        status: ValidationStatus::Valid,
        selection_mode: SelectionMode::Count { count: n },
        matched_resources: ids.iter().map(|id| id.to_string()).collect(),
        required_count: n,
        discovered_count: n,
        found_count: n,
        eligible_count: n,
        reasons: ids
            .iter()
            .map(|id| Eligibility::eligible(*id, "state running"))
            .collect(),
        rejections: BTreeMap::new(),
        diagnostics: Vec::new(),
    }
}

/// Fixture inventory that counts list calls and can be switched to fail.
#[derive(Debug, Default)]
pub struct ScriptedInventory {
    inner: FixtureInventory,
    failure: Mutex<Option<DiscoveryError>>,
    calls: AtomicUsize,
}

impl ScriptedInventory {
    pub fn new(inner: FixtureInventory) -> Self {
        Self {
            inner,
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_resources(resources: Vec<ResourceRecord>) -> Self {
        Self::new(FixtureInventory::from_resources(resources))
    }

    /// Every subsequent call fails with `err`.
    pub fn fail_with(&self, err: DiscoveryError) {
        *self.failure.lock().expect("failure lock") = Some(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InventoryProvider for ScriptedInventory {
    fn list_page(
        &self,
        query: &InventoryQuery,
        page_token: Option<&str>,
    ) -> Result<InventoryPage, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.lock().expect("failure lock").clone() {
            return Err(err);
        }
        self.inner.list_page(query, page_token)
    }
}

/// One call observed by [`ScriptedFaultService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    CreateTemplate { client_token: String, action_id: String },
    Start(String),
    Stop(String),
    GetStatus(String),
}

/// Fault service replaying queued responses.
///
/// Empty queues fall back to success: sequential template and run ids, and a
/// `running` status.
#[derive(Debug, Default)]
pub struct ScriptedFaultService {
    creates: Mutex<VecDeque<Result<String, ServiceError>>>,
    starts: Mutex<VecDeque<Result<String, ServiceError>>>,
    statuses: Mutex<VecDeque<Result<RunStatus, ServiceError>>>,
    stops: Mutex<VecDeque<Result<RunStatus, ServiceError>>>,
    exported_role: Mutex<Option<Result<String, ServiceError>>>,
    calls: Mutex<Vec<ServiceCall>>,
    requests: Mutex<Vec<TemplateRequest>>,
}

impl ScriptedFaultService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_create(&self, response: Result<String, ServiceError>) {
        self.creates.lock().expect("lock").push_back(response);
    }

    pub fn push_start(&self, response: Result<String, ServiceError>) {
        self.starts.lock().expect("lock").push_back(response);
    }

    pub fn push_status(&self, response: Result<RunStatus, ServiceError>) {
        self.statuses.lock().expect("lock").push_back(response);
    }

    pub fn push_states(&self, states: &[RunState]) {
        for state in states {
            self.push_status(Ok(RunStatus::new(*state)));
        }
    }

    pub fn push_stop(&self, response: Result<RunStatus, ServiceError>) {
        self.stops.lock().expect("lock").push_back(response);
    }

    /// Answer for `exported_role`; unset means no export exists.
    pub fn set_exported_role(&self, response: Result<String, ServiceError>) {
        *self.exported_role.lock().expect("lock") = Some(response);
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn requests(&self) -> Vec<TemplateRequest> {
        self.requests.lock().expect("lock").clone()
    }

    fn record(&self, call: ServiceCall) -> usize {
        let mut calls = self.calls.lock().expect("lock");
        calls.push(call);
        calls.len()
    }
}

impl FaultService for ScriptedFaultService {
    fn create_template(&self, request: &TemplateRequest) -> Result<String, ServiceError> {
        let n = self.record(ServiceCall::CreateTemplate {
            client_token: request.client_token.clone(),
            action_id: request.action_id.clone(),
        });
        self.requests.lock().expect("lock").push(request.clone());
        self.creates
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(format!("EXT{n}")))
    }

    fn start(&self, template_id: &str) -> Result<String, ServiceError> {
        let n = self.record(ServiceCall::Start(template_id.to_string()));
        self.starts
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(format!("EXP{n}")))
    }

    fn stop(&self, run_id: &str) -> Result<RunStatus, ServiceError> {
        self.record(ServiceCall::Stop(run_id.to_string()));
        self.stops
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(RunStatus::new(RunState::Stopping)))
    }

    fn get_status(&self, run_id: &str) -> Result<RunStatus, ServiceError> {
        self.record(ServiceCall::GetStatus(run_id.to_string()));
        self.statuses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(RunStatus::new(RunState::Running)))
    }

    fn exported_role(&self) -> Result<Option<String>, ServiceError> {
        self.exported_role.lock().expect("lock").clone().transpose()
    }
}

/// Memory store whose numbered `get` and `compare_and_set` calls can fail.
///
/// Calls are counted from 1 per operation; a failing call changes nothing.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_gets: BTreeSet<usize>,
    failing_writes: BTreeSet<usize>,
    gets: AtomicUsize,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_gets(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.failing_gets.extend(calls);
        self
    }

    pub fn fail_writes(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.failing_writes.extend(calls);
        self
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl ExperimentStore for FlakyStore {
    fn insert(&self, record: &ExperimentRecord) -> Result<(), StoreError> {
        self.inner.insert(record)
    }

    fn get(&self, id: &str) -> Result<Option<ExperimentRecord>, StoreError> {
        let n = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_gets.contains(&n) {
            return Err(StoreError::LockTimeout(format!("{id} (read {n})")));
        }
        self.inner.get(id)
    }

    fn list(&self) -> Result<Vec<ExperimentRecord>, StoreError> {
        self.inner.list()
    }

    fn compare_and_set(
        &self,
        expected: ExperimentStatus,
        next: &ExperimentRecord,
    ) -> Result<CasOutcome, StoreError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_writes.contains(&n) {
            return Err(StoreError::LockTimeout(format!("{} (write {n})", next.id)));
        }
        self.inner.compare_and_set(expected, next)
    }
}

/// Clock whose `sleep` advances time instantly and records each duration.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            sleeps: Mutex::new(Vec::new()),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("lock").clone()
    }

    pub fn slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("lock")
    }

    fn sleep(&self, duration: Duration) {
        *self.now.lock().expect("lock") += duration;
        self.sleeps.lock().expect("lock").push(duration);
    }
}
