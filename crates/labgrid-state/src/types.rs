//! Domain types for the labgrid object store.
//!
//! Every stored object has the same envelope: [`ObjectMeta`], a kind-specific
//! spec and a kind-specific status. The envelope is generic ([`Object`]) and
//! the concrete kinds are type aliases over it, so the store can implement
//! versioning, ownership and deletion once for all kinds.

use std::collections::BTreeMap;
use std::fmt;

use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::tables::*;

/// Label joining a problem environment to the problem it was created from.
pub const LABEL_PROBLEM_NAME: &str = "problemName";

/// Namespace holding worker heartbeat leases unless configured otherwise.
pub const DEFAULT_LEASE_NAMESPACE: &str = "labgrid";

/// Lease validity used when a lease does not carry its own duration.
pub const DEFAULT_LEASE_DURATION_SECONDS: u32 = 5;

// ── Kinds ─────────────────────────────────────────────────────────

/// The kinds of object held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Problem,
    ProblemEnvironment,
    Worker,
    Lease,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Problem,
        ResourceKind::ProblemEnvironment,
        ResourceKind::Worker,
        ResourceKind::Lease,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Problem => "Problem",
            ResourceKind::ProblemEnvironment => "ProblemEnvironment",
            ResourceKind::Worker => "Worker",
            ResourceKind::Lease => "Lease",
        }
    }

    pub(crate) fn table(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            ResourceKind::Problem => PROBLEMS,
            ResourceKind::ProblemEnvironment => ENVIRONMENTS,
            ResourceKind::Worker => WORKERS,
            ResourceKind::Lease => LEASES,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Metadata ──────────────────────────────────────────────────────

/// Metadata shared by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    /// Only set for namespaced kinds (leases).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Prefix used to derive `name` at creation when `name` is empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    #[serde(default)]
    pub uid: String,
    /// Incremented on every write; used for conditional updates.
    #[serde(default)]
    pub resource_version: u64,
    /// Incremented whenever the spec changes.
    #[serde(default)]
    pub generation: u64,
    /// Unix timestamp (milliseconds) of creation.
    #[serde(default)]
    pub creation_timestamp: u64,
    /// Unix timestamp (milliseconds) at which deletion was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<u64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Build the key for this object's table.
    pub fn table_key(&self) -> String {
        table_key(&self.namespace, &self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|r| r.uid == uid)
    }

    /// An owner reference pointing at this object.
    pub fn owner_reference(&self, kind: ResourceKind) -> OwnerReference {
        OwnerReference {
            kind,
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: true,
        }
    }
}

pub(crate) fn table_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Points from a dependent object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: ResourceKind,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

// ── Generic envelope ──────────────────────────────────────────────

/// A stored object: metadata, desired state and observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize, T: Serialize",
    deserialize = "S: Deserialize<'de>, T: Deserialize<'de> + Default"
))]
pub struct Object<S, T> {
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: T,
}

impl<S, T: Default> Object<S, T> {
    pub fn new(metadata: ObjectMeta, spec: S) -> Self {
        Self {
            metadata,
            spec,
            status: T::default(),
        }
    }
}

/// Implemented by every spec type; ties the spec to its kind.
pub trait ResourceSpec:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ResourceKind;
}

/// Anything the store can persist.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
    fn spec_eq(&self, other: &Self) -> bool;
    /// Replace this object's status with the status of `other`.
    fn take_status_from(&mut self, other: Self);
}

impl<S, T> Resource for Object<S, T>
where
    S: ResourceSpec,
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    const KIND: ResourceKind = S::KIND;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }

    fn take_status_from(&mut self, other: Self) {
        self.status = other.status;
    }
}

// ── Problem ───────────────────────────────────────────────────────

pub type Problem = Object<ProblemSpec, ProblemStatus>;

/// A lab template plus the number of ready, unassigned replicas to keep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub template: EnvironmentTemplate,
    #[serde(default)]
    pub assignable_replicas: u32,
}

impl ResourceSpec for ProblemSpec {
    const KIND: ResourceKind = ResourceKind::Problem;
}

/// Metadata and spec stamped onto every environment created for a problem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentTemplate {
    #[serde(default)]
    pub metadata: TemplateMeta,
    pub spec: EnvironmentSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateMeta {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemStatus {
    #[serde(default)]
    pub replicas: ReplicaCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCounts {
    /// Every environment owned by the problem.
    pub total: u32,
    /// Environments whose placement has been confirmed.
    pub scheduled: u32,
    /// Ready environments not yet handed out.
    pub assignable: u32,
    /// Ready environments handed out to a client.
    pub assigned: u32,
}

// ── ProblemEnvironment ────────────────────────────────────────────

pub type ProblemEnvironment = Object<EnvironmentSpec, EnvironmentStatus>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Topology definition deployed on the worker.
    pub topology_ref: FileRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_refs: Vec<FileRef>,
    /// Worker hosting the environment; empty until scheduled.
    #[serde(default)]
    pub worker_name: String,
    /// Every selector must match the worker's labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_selectors: Vec<WorkerSelector>,
}

impl ResourceSpec for EnvironmentSpec {
    const KIND: ResourceKind = ResourceKind::ProblemEnvironment;
}

/// Reference to a file held by an external config source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub key: String,
}

/// Label-equality filter restricting which workers may host an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl WorkerSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<ContainersStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

/// Container state reported by the worker-side driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainersStatus {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub details: Vec<ContainerDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDetail {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub management_ip_address: String,
}

impl ProblemEnvironment {
    /// Login name handed to clients of this environment.
    pub fn username(&self) -> String {
        format!("nc_{}", self.metadata.name)
    }

    /// True iff at least one container is reported and all of them are ready.
    pub fn containers_ready(&self) -> bool {
        match &self.status.containers {
            Some(c) => !c.details.is_empty() && c.details.iter().all(|d| d.ready),
            None => false,
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────

pub type Worker = Object<WorkerSpec, WorkerStatus>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    #[serde(default)]
    pub disable_schedule: bool,
}

impl ResourceSpec for WorkerSpec {
    const KIND: ResourceKind = ResourceKind::Worker;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    #[serde(default)]
    pub worker_info: WorkerInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Telemetry and reachability reported by the worker itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    #[serde(default)]
    pub external_ip_address: String,
    #[serde(default)]
    pub external_port: u16,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub cpu_used_percent: Option<f64>,
    #[serde(default)]
    pub memory_used_percent: Option<f64>,
}

// ── Lease ─────────────────────────────────────────────────────────

pub type Lease = Object<LeaseSpec, ()>;

/// Liveness record renewed by the agent running on each worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSpec {
    #[serde(default)]
    pub holder_identity: String,
    /// Unix timestamp (milliseconds) of the last renewal.
    #[serde(default)]
    pub renew_time: Option<u64>,
    #[serde(default)]
    pub lease_duration_seconds: Option<u32>,
}

impl ResourceSpec for LeaseSpec {
    const KIND: ResourceKind = ResourceKind::Lease;
}

impl LeaseSpec {
    pub fn duration_seconds(&self) -> u32 {
        self.lease_duration_seconds
            .unwrap_or(DEFAULT_LEASE_DURATION_SECONDS)
    }

    /// Whether the lease is still valid at `now_ms`.
    pub fn is_live_at(&self, now_ms: u64) -> bool {
        match self.renew_time {
            Some(renewed) => renewed + u64::from(self.duration_seconds()) * 1000 > now_ms,
            None => false,
        }
    }
}

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
