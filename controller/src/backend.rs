// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the remote virtualization backend
//!
//! The wire protocol is somebody else's problem: everything here is the typed
//! surface the controller needs, implemented by a real client in production
//! and by [`crate::sim::SimBackend`] in tests.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use vmop_common::api::CreateResult;
use vmop_common::api::Error;
use vmop_common::api::LookupResult;
use vmop_common::api::MetadataTransport;
use vmop_common::api::NetworkInterfaceStatus;
use vmop_common::api::PowerState;
use vmop_common::api::UpdateResult;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum ObjectKind {
    VirtualMachine,
    ResourcePool,
    HostSystem,
    ClusterComputeResource,
    Folder,
    Task,
}

/// Handle to an object living on the backend
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub value: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, value: impl Into<String>) -> ObjectRef {
        ObjectRef { kind, value: value.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Network identity of the backend endpoint
///
/// Sessions are bound to one endpoint; when its identity changes every cached
/// session is stale.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Names of the datacenter and cluster a session operates in
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InventoryPath {
    pub datacenter: String,
    pub cluster: String,
}

/// Handles resolved from an [`InventoryPath`] when a session is established
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Inventory {
    pub cluster: ObjectRef,
    pub resource_pool: ObjectRef,
    pub vm_folder: ObjectRef,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceAllocation {
    pub reservation: Option<u64>,
    pub limit: Option<u64>,
}

/// The portion of a machine's configuration the controller converges
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VmConfig {
    pub num_cpus: u32,
    pub memory_mib: u64,
    pub cpu_allocation: ResourceAllocation,
    pub memory_allocation: ResourceAllocation,
    pub extra_config: BTreeMap<String, String>,
}

/// A reconfigure request: only the fields that differ from the live
/// configuration are set
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigDelta {
    pub num_cpus: Option<u32>,
    pub memory_mib: Option<u64>,
    pub cpu_allocation: Option<ResourceAllocation>,
    pub memory_allocation: Option<ResourceAllocation>,
    pub extra_config: BTreeMap<String, String>,
}

impl ConfigDelta {
    pub fn is_empty(&self) -> bool {
        self.num_cpus.is_none()
            && self.memory_mib.is_none()
            && self.cpu_allocation.is_none()
            && self.memory_allocation.is_none()
            && self.extra_config.is_empty()
    }

    /// Apply this delta to `config`, as the backend does on reconfigure.
    pub fn apply_to(&self, config: &mut VmConfig) {
        if let Some(num_cpus) = self.num_cpus {
            config.num_cpus = num_cpus;
        }
        if let Some(memory_mib) = self.memory_mib {
            config.memory_mib = memory_mib;
        }
        if let Some(allocation) = &self.cpu_allocation {
            config.cpu_allocation = allocation.clone();
        }
        if let Some(allocation) = &self.memory_allocation {
            config.memory_allocation = allocation.clone();
        }
        config.extra_config.extend(
            self.extra_config.iter().map(|(k, v)| (k.clone(), v.clone())),
        );
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NicSpec {
    pub network_type: String,
    pub network_name: String,
    pub card_type: Option<String>,
}

/// Content library item a machine is deployed from
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ImageSource {
    pub library_uuid: Uuid,
    pub item_name: String,
}

/// Guest metadata delivered at deploy time by a transport other than extra
/// config
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuestMetadata {
    pub transport: MetadataTransport,
    pub data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreateSpec {
    pub name: String,
    pub folder: ObjectRef,
    pub pool: ObjectRef,
    pub host: Option<ObjectRef>,
    pub config: VmConfig,
    pub nics: Vec<NicSpec>,
    pub image: ImageSource,
    pub metadata: Option<GuestMetadata>,
    pub storage_class: Option<String>,
}

/// Live properties of a backend machine
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmProperties {
    pub power_state: PowerState,
    pub host: Option<String>,
    pub guest_ip: Option<String>,
    pub bios_uuid: Option<String>,
    pub instance_uuid: Option<String>,
    pub config: VmConfig,
    pub nics: Vec<NetworkInterfaceStatus>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Queued,
    Running,
    Success { result: Option<ObjectRef> },
    Error { message: String },
}

/// The configuration placement is computed for
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlacementCandidate {
    pub name: String,
    pub config: VmConfig,
    pub storage_class: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlacementTarget {
    /// place within one cluster
    Cluster(ObjectRef),
    /// place across the clusters backing these resource pools
    ResourcePools(Vec<ObjectRef>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlacementRequest {
    pub target: PlacementTarget,
    pub candidate: PlacementCandidate,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecommendationReason {
    XvmotionPlacement,
    XClusterPlacement,
    Other(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlacementAction {
    Placement { pool: Option<ObjectRef>, host: Option<ObjectRef> },
    Other { kind: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackendRecommendation {
    pub reason: RecommendationReason,
    pub actions: Vec<PlacementAction>,
}

/// Faults the backend reported for one candidate resource pool
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlacementFault {
    pub pool: ObjectRef,
    pub messages: Vec<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PlacementResponse {
    pub recommendations: Vec<BackendRecommendation>,
    pub faults: Vec<PlacementFault>,
}

/// Establishes authenticated connections to the backend
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        tenant: &str,
    ) -> Result<Arc<dyn BackendClient>, Error>;
}

/// One authenticated connection to the backend
///
/// Mutating calls return a handle to the asynchronous task carrying out the
/// mutation; see [`crate::task::wait_for_task`].
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn locate(&self, path: &InventoryPath) -> LookupResult<Inventory>;

    async fn find_child_pool(
        &self,
        parent: &ObjectRef,
        name: &str,
    ) -> LookupResult<ObjectRef>;

    async fn find_child_folder(
        &self,
        parent: &ObjectRef,
        name: &str,
    ) -> LookupResult<ObjectRef>;

    /// Find a machine by name anywhere beneath `folder`.
    async fn find_vm_by_name(
        &self,
        folder: &ObjectRef,
        name: &str,
    ) -> LookupResult<ObjectRef>;

    async fn vm_properties(&self, vm: &ObjectRef)
        -> LookupResult<VmProperties>;

    async fn create_vm(&self, spec: &CreateSpec) -> CreateResult<ObjectRef>;

    async fn reconfigure_vm(
        &self,
        vm: &ObjectRef,
        delta: &ConfigDelta,
    ) -> UpdateResult<ObjectRef>;

    async fn power_on(&self, vm: &ObjectRef) -> UpdateResult<ObjectRef>;

    async fn power_off(&self, vm: &ObjectRef) -> UpdateResult<ObjectRef>;

    async fn destroy_vm(&self, vm: &ObjectRef) -> Result<ObjectRef, Error>;

    async fn task_state(&self, task: &ObjectRef) -> LookupResult<TaskState>;

    async fn place_vm(
        &self,
        request: &PlacementRequest,
    ) -> Result<PlacementResponse, Error>;

    async fn logout(&self) -> Result<(), Error>;
}
