//! AWS CLI backed inventory and fault-injection service.
//!
//! Every call shells out to `aws ... --output json` (or `kubectl` for pods)
//! through [`run_command_with_timeout`]. Only `describe-*`, `list-*` and
//! `get-*` calls are issued for discovery.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::config::AwsConfig;
use super::fault_service::{
    FaultService, RunState, RunStatus, ServiceError, TemplateRejection, TemplateRequest,
};
use super::inventory::{DiscoveryError, InventoryPage, InventoryProvider, InventoryQuery};
use super::process::run_command_with_timeout;
use crate::core::types::{ResourceRecord, ResourceState, ResourceType, Topology};

/// Failed CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliFailure {
    /// Service error code, e.g. `AccessDeniedException`.
    pub code: Option<String>,
    pub message: String,
}

impl CliFailure {
    fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn into_discovery_error(self) -> DiscoveryError {
        let Some(code) = self.code.as_deref() else {
            return classify_uncoded(self.message);
        };
        if is_access_denied(code) {
            DiscoveryError::AccessDenied(format!("{code}: {}", self.message))
        } else if code.contains("NotFound") {
            DiscoveryError::ScopeNotFound(format!("{code}: {}", self.message))
        } else {
            DiscoveryError::Unreachable(format!("{code}: {}", self.message))
        }
    }

    pub fn into_service_error(self) -> ServiceError {
        match self.code {
            Some(code) => {
                let payload = json!({ "code": code, "message": self.message });
                ServiceError::Rejected(TemplateRejection {
                    code,
                    message: self.message,
                    payload: Some(payload),
                })
            }
            None => ServiceError::Unavailable(self.message),
        }
    }
}

fn is_access_denied(code: &str) -> bool {
    code.contains("AccessDenied")
        || code.contains("Unauthorized")
        || code == "AuthFailure"
        || code == "UnrecognizedClientException"
        || code == "InvalidClientTokenId"
        || code.starts_with("ExpiredToken")
}

fn classify_uncoded(message: String) -> DiscoveryError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("forbidden") || lower.contains("unable to locate credentials") {
        DiscoveryError::AccessDenied(message)
    } else if lower.contains("notfound")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        DiscoveryError::ScopeNotFound(message)
    } else {
        DiscoveryError::Unreachable(message)
    }
}

static CLI_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"An error occurred \(([A-Za-z0-9_.]+)\)(?: when calling the \w+ operation)?(?: \(.*?\))?: (.*)",
    )
    .expect("cli error regex")
});

/// Split AWS CLI stderr into service code and message.
pub fn parse_cli_error(stderr: &str) -> CliFailure {
    let stderr = stderr.trim();
    match CLI_ERROR_RE.captures(stderr) {
        Some(caps) => CliFailure {
            code: caps.get(1).map(|m| m.as_str().to_string()),
            message: caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        },
        None => CliFailure::transport(if stderr.is_empty() {
            "command failed without output".to_string()
        } else {
            stderr.to_string()
        }),
    }
}

/// AWS and kubectl CLIs bound to one region.
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: String,
    kubectl_binary: String,
    profile: Option<String>,
    region: String,
    timeout: Duration,
    output_limit_bytes: usize,
    role_export: String,
}

impl AwsCli {
    pub fn new(cfg: &AwsConfig, region: impl Into<String>) -> Self {
        Self {
            binary: cfg.binary.clone(),
            kubectl_binary: cfg.kubectl_binary.clone(),
            profile: cfg.profile.clone(),
            region: region.into(),
            timeout: Duration::from_secs(cfg.command_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            role_export: cfg.role_export.trim().to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn aws(&self, args: &[String]) -> Result<Value, CliFailure> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .args(["--region", self.region.as_str(), "--output", "json"]);
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile.as_str()]);
        }
        self.run_json(cmd)
    }

    fn kubectl(&self, args: &[String]) -> Result<Value, CliFailure> {
        let mut cmd = Command::new(&self.kubectl_binary);
        cmd.args(args);
        self.run_json(cmd)
    }

    fn run_json(&self, cmd: Command) -> Result<Value, CliFailure> {
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .map_err(|err| CliFailure::transport(format!("{err:#}")))?;
        if output.timed_out {
            return Err(CliFailure::transport(format!(
                "command timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        if !output.status.success() {
            return Err(parse_cli_error(&output.stderr_lossy()));
        }
        if output.is_truncated() {
            return Err(CliFailure::transport(format!(
                "output exceeded {} bytes",
                self.output_limit_bytes
            )));
        }
        let stdout = output.stdout_lossy();
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout)
            .map_err(|err| CliFailure::transport(format!("invalid JSON from CLI: {err}")))
    }

    fn list(&self, base: &[&str], query: &InventoryQuery, token: Option<&str>) -> Result<Value, DiscoveryError> {
        let mut args = strings(base);
        args.extend(strings(&["--max-items", query.page_size.to_string().as_str()]));
        if let Some(token) = token {
            args.extend(strings(&["--starting-token", token]));
        }
        self.aws(&args).map_err(CliFailure::into_discovery_error)
    }

    fn list_ec2(&self, query: &InventoryQuery, token: Option<&str>) -> Result<InventoryPage, DiscoveryError> {
        let value = self.list(&["ec2", "describe-instances"], query, token)?;
        parse_ec2_page(value, &self.region)
    }

    fn list_rds_clusters(&self, query: &InventoryQuery, token: Option<&str>) -> Result<InventoryPage, DiscoveryError> {
        let value = self.list(&["rds", "describe-db-clusters"], query, token)?;
        parse_rds_cluster_page(value)
    }

    fn list_rds_instances(&self, query: &InventoryQuery, token: Option<&str>) -> Result<InventoryPage, DiscoveryError> {
        let value = self.list(&["rds", "describe-db-instances"], query, token)?;
        parse_rds_instance_page(value)
    }

    fn list_replication_groups(&self, query: &InventoryQuery, token: Option<&str>) -> Result<InventoryPage, DiscoveryError> {
        let value = self.list(&["elasticache", "describe-replication-groups"], query, token)?;
        let mut page = parse_replication_group_page(value)?;
        for resource in &mut page.resources {
            let Some(arn) = resource.arn.clone() else {
                continue;
            };
            let tags = self
                .aws(&strings(&["elasticache", "list-tags-for-resource", "--resource-name", arn.as_str()]))
                .map_err(CliFailure::into_discovery_error)?;
            let parsed: TagListResponse = decode(tags)?;
            resource.tags = tag_map(parsed.tag_list);
        }
        Ok(page)
    }

    fn list_load_balancers(&self, query: &InventoryQuery, token: Option<&str>) -> Result<InventoryPage, DiscoveryError> {
        let value = self.list(&["elbv2", "describe-load-balancers"], query, token)?;
        let mut page = parse_load_balancer_page(value)?;
        let arns: Vec<String> = page.resources.iter().filter_map(|r| r.arn.clone()).collect();
        let mut tags_by_arn = BTreeMap::new();
        for chunk in arns.chunks(20) {
            let mut args = strings(&["elbv2", "describe-tags", "--resource-arns"]);
            args.extend(chunk.iter().cloned());
            let value = self.aws(&args).map_err(CliFailure::into_discovery_error)?;
            let parsed: TagDescriptions = decode(value)?;
            for description in parsed.tag_descriptions {
                tags_by_arn.insert(description.resource_arn, tag_map(description.tags));
            }
        }
        for resource in &mut page.resources {
            if let Some(tags) = resource.arn.as_ref().and_then(|arn| tags_by_arn.remove(arn)) {
                resource.tags = tags;
            }
        }
        Ok(page)
    }

    fn list_nodegroups(&self, query: &InventoryQuery, token: Option<&str>) -> Result<InventoryPage, DiscoveryError> {
        let cluster = query
            .scope
            .cluster
            .as_deref()
            .ok_or_else(|| DiscoveryError::ScopeNotFound("node groups need a cluster".to_string()))?;
        let value = self.list(&["eks", "list-nodegroups", "--cluster-name", cluster], query, token)?;
        let listing: NodegroupListing = decode(value)?;
        let mut resources = Vec::with_capacity(listing.nodegroups.len());
        for name in &listing.nodegroups {
            let value = self
                .aws(&strings(&[
                    "eks",
                    "describe-nodegroup",
                    "--cluster-name",
                    cluster,
                    "--nodegroup-name",
                    name,
                ]))
                .map_err(CliFailure::into_discovery_error)?;
            resources.push(parse_nodegroup(value, cluster)?);
        }
        Ok(InventoryPage {
            resources,
            next_token: listing.next_token,
        })
    }

    fn list_pods(&self, query: &InventoryQuery) -> Result<InventoryPage, DiscoveryError> {
        let scope = &query.scope;
        let (Some(cluster), Some(namespace)) = (&scope.cluster, &scope.namespace) else {
            return Err(DiscoveryError::ScopeNotFound(
                "pods need a cluster and namespace".to_string(),
            ));
        };
        let mut args = strings(&[
            "--context",
            cluster.as_str(),
            "get",
            "pods",
            "--namespace",
            namespace.as_str(),
            "--output",
            "json",
            "--chunk-size",
            query.page_size.to_string().as_str(),
        ]);
        if let Some(selector) = &scope.label_selector {
            args.extend(strings(&["--selector", selector.as_str()]));
        }
        let value = self.kubectl(&args).map_err(|failure| classify_uncoded(failure.message))?;
        parse_pod_list(value, cluster)
    }

    fn fis(&self, args: &[&str]) -> Result<Value, ServiceError> {
        self.aws(&strings(args)).map_err(CliFailure::into_service_error)
    }
}

impl InventoryProvider for AwsCli {
    #[instrument(skip_all, fields(resource_type = %query.resource_type, region = %self.region))]
    fn list_page(
        &self,
        query: &InventoryQuery,
        page_token: Option<&str>,
    ) -> Result<InventoryPage, DiscoveryError> {
        debug!(page_token, "listing inventory page");
        let page = match query.resource_type {
            ResourceType::Ec2Instance => self.list_ec2(query, page_token),
            ResourceType::RdsCluster => self.list_rds_clusters(query, page_token),
            ResourceType::RdsInstance => self.list_rds_instances(query, page_token),
            ResourceType::ElastiCacheReplicationGroup => {
                self.list_replication_groups(query, page_token)
            }
            ResourceType::LoadBalancer => self.list_load_balancers(query, page_token),
            ResourceType::EksNodegroup => self.list_nodegroups(query, page_token),
            ResourceType::EksPod => self.list_pods(query),
        };
        if let Err(err) = &page {
            warn!(error = %err, "inventory call failed");
        }
        page
    }
}

impl FaultService for AwsCli {
    #[instrument(skip_all, fields(experiment_id = %request.experiment_id))]
    fn create_template(&self, request: &TemplateRequest) -> Result<String, ServiceError> {
        let body = request.to_service_json().to_string();
        let value = self.fis(&["fis", "create-experiment-template", "--cli-input-json", body.as_str()])?;
        value
            .pointer("/experimentTemplate/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Unavailable("response missing experimentTemplate.id".to_string()))
    }

    #[instrument(skip_all, fields(template_id = %template_id))]
    fn start(&self, template_id: &str) -> Result<String, ServiceError> {
        let value = self.fis(&["fis", "start-experiment", "--experiment-template-id", template_id])?;
        value
            .pointer("/experiment/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Unavailable("response missing experiment.id".to_string()))
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    fn stop(&self, run_id: &str) -> Result<RunStatus, ServiceError> {
        let value = self.fis(&["fis", "stop-experiment", "--id", run_id])?;
        parse_run_status(value)
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    fn get_status(&self, run_id: &str) -> Result<RunStatus, ServiceError> {
        let value = self.fis(&["fis", "get-experiment", "--id", run_id])?;
        parse_run_status(value)
    }

    #[instrument(skip_all, fields(export = %self.role_export))]
    fn exported_role(&self) -> Result<Option<String>, ServiceError> {
        if self.role_export.is_empty() {
            return Ok(None);
        }
        let value = self.fis(&["cloudformation", "list-exports"])?;
        let role = parse_role_export(value, &self.role_export)?;
        debug!(found = role.is_some(), "execution role export lookup");
        Ok(role)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExportList {
    #[serde(default)]
    exports: Vec<StackExport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackExport {
    name: String,
    value: String,
}

/// Value of the export called `name` in a `list-exports` response.
pub fn parse_role_export(value: Value, name: &str) -> Result<Option<String>, ServiceError> {
    let list: ExportList = serde_json::from_value(value)
        .map_err(|err| ServiceError::Unavailable(format!("invalid list-exports response: {err}")))?;
    Ok(list
        .exports
        .into_iter()
        .find(|export| export.name == name)
        .map(|export| export.value.trim().to_string())
        .filter(|arn| !arn.is_empty()))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, DiscoveryError> {
    serde_json::from_value(value).map_err(|err| DiscoveryError::Malformed(err.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

fn tag_map(tags: Vec<Tag>) -> BTreeMap<String, String> {
    tags.into_iter().map(|tag| (tag.key, tag.value)).collect()
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    #[serde(rename = "TagList", default)]
    tag_list: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagDescriptions {
    #[serde(default)]
    tag_descriptions: Vec<TagDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagDescription {
    resource_arn: String,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Page {
    #[serde(default)]
    reservations: Vec<Reservation>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    owner_id: Option<String>,
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    state: Option<NamedState>,
    placement: Option<Placement>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NamedState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Placement {
    availability_zone: Option<String>,
}

pub fn parse_ec2_page(value: Value, region: &str) -> Result<InventoryPage, DiscoveryError> {
    let page: Ec2Page = decode(value)?;
    let mut resources = Vec::new();
    for reservation in page.reservations {
        for instance in reservation.instances {
            let arn = reservation.owner_id.as_ref().map(|owner| {
                format!("arn:aws:ec2:{region}:{owner}:instance/{}", instance.instance_id)
            });
            resources.push(ResourceRecord {
                arn,
                resource_type: ResourceType::Ec2Instance,
                state: instance
                    .state
                    .map_or(ResourceState::Unknown, |s| ResourceState::from_provider(&s.name)),
                tags: tag_map(instance.tags),
                topology: Topology {
                    availability_zones: instance
                        .placement
                        .and_then(|p| p.availability_zone)
                        .into_iter()
                        .collect(),
                    ..Topology::default()
                },
                id: instance.instance_id,
            });
        }
    }
    Ok(InventoryPage {
        resources,
        next_token: page.next_token,
    })
}

#[derive(Debug, Deserialize)]
struct RdsClusterPage {
    #[serde(rename = "DBClusters", default)]
    clusters: Vec<RdsCluster>,
    #[serde(rename = "NextToken")]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RdsCluster {
    #[serde(rename = "DBClusterIdentifier")]
    id: String,
    #[serde(rename = "DBClusterArn")]
    arn: Option<String>,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "DBClusterMembers", default)]
    members: Vec<Value>,
    #[serde(rename = "AvailabilityZones", default)]
    availability_zones: Vec<String>,
    #[serde(rename = "TagList", default)]
    tags: Vec<Tag>,
}

pub fn parse_rds_cluster_page(value: Value) -> Result<InventoryPage, DiscoveryError> {
    let page: RdsClusterPage = decode(value)?;
    let resources = page
        .clusters
        .into_iter()
        .map(|cluster| ResourceRecord {
            id: cluster.id,
            arn: cluster.arn,
            resource_type: ResourceType::RdsCluster,
            state: ResourceState::from_provider(&cluster.status),
            tags: tag_map(cluster.tags),
            topology: Topology {
                group_member_count: Some(cluster.members.len() as u32),
                availability_zones: cluster.availability_zones,
                ..Topology::default()
            },
        })
        .collect();
    Ok(InventoryPage {
        resources,
        next_token: page.next_token,
    })
}

#[derive(Debug, Deserialize)]
struct RdsInstancePage {
    #[serde(rename = "DBInstances", default)]
    instances: Vec<RdsInstance>,
    #[serde(rename = "NextToken")]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RdsInstance {
    #[serde(rename = "DBInstanceIdentifier")]
    id: String,
    #[serde(rename = "DBInstanceArn")]
    arn: Option<String>,
    #[serde(rename = "DBInstanceStatus")]
    status: String,
    #[serde(rename = "DBClusterIdentifier")]
    cluster: Option<String>,
    #[serde(rename = "AvailabilityZone")]
    availability_zone: Option<String>,
    #[serde(rename = "TagList", default)]
    tags: Vec<Tag>,
}

pub fn parse_rds_instance_page(value: Value) -> Result<InventoryPage, DiscoveryError> {
    let page: RdsInstancePage = decode(value)?;
    let resources = page
        .instances
        .into_iter()
        .map(|instance| ResourceRecord {
            id: instance.id,
            arn: instance.arn,
            resource_type: ResourceType::RdsInstance,
            state: ResourceState::from_provider(&instance.status),
            tags: tag_map(instance.tags),
            topology: Topology {
                parent_group: instance.cluster,
                availability_zones: instance.availability_zone.into_iter().collect(),
                ..Topology::default()
            },
        })
        .collect();
    Ok(InventoryPage {
        resources,
        next_token: page.next_token,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReplicationGroupPage {
    #[serde(default)]
    replication_groups: Vec<ReplicationGroup>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReplicationGroup {
    replication_group_id: String,
    #[serde(rename = "ARN")]
    arn: Option<String>,
    status: String,
    #[serde(default)]
    member_clusters: Vec<String>,
    #[serde(default)]
    node_groups: Vec<CacheNodeGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CacheNodeGroup {
    #[serde(default)]
    node_group_members: Vec<CacheNodeGroupMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CacheNodeGroupMember {
    preferred_availability_zone: Option<String>,
}

pub fn parse_replication_group_page(value: Value) -> Result<InventoryPage, DiscoveryError> {
    let page: ReplicationGroupPage = decode(value)?;
    let resources = page
        .replication_groups
        .into_iter()
        .map(|group| {
            let mut zones: Vec<String> = group
                .node_groups
                .iter()
                .flat_map(|ng| ng.node_group_members.iter())
                .filter_map(|m| m.preferred_availability_zone.clone())
                .collect();
            zones.sort();
            zones.dedup();
            ResourceRecord {
                id: group.replication_group_id,
                arn: group.arn,
                resource_type: ResourceType::ElastiCacheReplicationGroup,
                state: ResourceState::from_provider(&group.status),
                tags: BTreeMap::new(),
                topology: Topology {
                    group_member_count: Some(group.member_clusters.len() as u32),
                    availability_zones: zones,
                    ..Topology::default()
                },
            }
        })
        .collect();
    Ok(InventoryPage {
        resources,
        next_token: page.next_token,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancerPage {
    #[serde(default)]
    load_balancers: Vec<LoadBalancer>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancer {
    load_balancer_arn: String,
    load_balancer_name: String,
    state: Option<LoadBalancerState>,
    #[serde(default)]
    availability_zones: Vec<Zone>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancerState {
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Zone {
    zone_name: String,
}

pub fn parse_load_balancer_page(value: Value) -> Result<InventoryPage, DiscoveryError> {
    let page: LoadBalancerPage = decode(value)?;
    let resources = page
        .load_balancers
        .into_iter()
        .map(|lb| ResourceRecord {
            id: lb.load_balancer_name,
            arn: Some(lb.load_balancer_arn),
            resource_type: ResourceType::LoadBalancer,
            state: lb
                .state
                .map_or(ResourceState::Unknown, |s| ResourceState::from_provider(&s.code)),
            tags: BTreeMap::new(),
            topology: Topology {
                availability_zones: lb.availability_zones.into_iter().map(|z| z.zone_name).collect(),
                ..Topology::default()
            },
        })
        .collect();
    Ok(InventoryPage {
        resources,
        next_token: page.next_token,
    })
}

#[derive(Debug, Deserialize)]
struct NodegroupListing {
    #[serde(default)]
    nodegroups: Vec<String>,
    #[serde(rename = "NextToken", alias = "nextToken")]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodegroupDescription {
    nodegroup: Nodegroup,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Nodegroup {
    nodegroup_name: String,
    nodegroup_arn: Option<String>,
    status: String,
    scaling_config: Option<ScalingConfig>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScalingConfig {
    min_size: Option<u32>,
    desired_size: Option<u32>,
}

pub fn parse_nodegroup(value: Value, cluster: &str) -> Result<ResourceRecord, DiscoveryError> {
    let described: NodegroupDescription = decode(value)?;
    let group = described.nodegroup;
    let scaling = group.scaling_config;
    Ok(ResourceRecord {
        id: group.nodegroup_name,
        arn: group.nodegroup_arn,
        resource_type: ResourceType::EksNodegroup,
        state: ResourceState::from_provider(&group.status),
        tags: group.tags,
        topology: Topology {
            parent_group: Some(cluster.to_string()),
            desired_size: scaling.as_ref().and_then(|s| s.desired_size),
            min_size: scaling.as_ref().and_then(|s| s.min_size),
            ..Topology::default()
        },
    })
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMetadata {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Deserialize)]
struct OwnerReference {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    phase: Option<String>,
}

/// Pods carry their labels as tags; the owning controller is the parent group.
pub fn parse_pod_list(value: Value, cluster: &str) -> Result<InventoryPage, DiscoveryError> {
    let list: PodList = decode(value)?;
    let resources = list
        .items
        .into_iter()
        .map(|pod| {
            let state = match pod.status.phase.as_deref() {
                Some("Succeeded") => ResourceState::Terminated,
                Some(phase) => ResourceState::from_provider(phase),
                None => ResourceState::Unknown,
            };
            ResourceRecord {
                id: pod.metadata.name,
                arn: None,
                resource_type: ResourceType::EksPod,
                state,
                tags: pod.metadata.labels,
                topology: Topology {
                    parent_group: pod
                        .metadata
                        .owner_references
                        .into_iter()
                        .next()
                        .map(|owner| owner.name)
                        .or_else(|| Some(cluster.to_string())),
                    ..Topology::default()
                },
            }
        })
        .collect();
    Ok(InventoryPage {
        resources,
        next_token: None,
    })
}

pub fn parse_run_status(value: Value) -> Result<RunStatus, ServiceError> {
    let state = value
        .pointer("/experiment/state/status")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::Unavailable("response missing experiment.state.status".to_string()))?;
    let state = RunState::from_service(state)
        .ok_or_else(|| ServiceError::Unavailable(format!("unknown run state '{state}'")))?;
    let reason = value
        .pointer("/experiment/state/reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    let payload = value.pointer("/experiment/state").cloned();
    Ok(RunStatus {
        state,
        reason,
        payload,
    })
}
