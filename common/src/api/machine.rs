// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual machine resource and the objects it references

use super::Condition;
use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Finalizer token the controller keeps on every machine it manages until the
/// backend machine is confirmed gone.
pub const VM_FINALIZER: &str = "virtualmachine.vmoperator.vmware.com";

/// Annotation that suspends reconciliation of a machine while present.
pub const PAUSE_RECONCILE_ANNOTATION: &str =
    "vmoperator.vmware.com/pause-reconcile";

/// Identifies one virtual machine in the control-plane store
#[derive(
    Clone,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct MachineKey {
    pub namespace: String,
    pub name: String,
}

impl MachineKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        MachineKey { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for MachineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    pub uid: Uuid,
    pub generation: i64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        };
        write!(f, "{}", s)
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq,
    Serialize,
)]
pub enum VmPhase {
    Creating,
    Created,
    Deleting,
    Deleted,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

impl VirtualMachine {
    pub fn key(&self) -> MachineKey {
        MachineKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata.finalizers.iter().any(|f| f == VM_FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.metadata.annotations.contains_key(PAUSE_RECONCILE_ANNOTATION)
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    pub image_name: String,
    pub class_name: String,
    pub power_state: PowerState,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    pub vm_metadata: Option<VmMetadata>,
    pub readiness_probe: Option<Probe>,
    pub resource_policy_name: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub network_type: String,
    pub network_name: String,
    pub ethernet_card_type: Option<String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    pub claim_name: String,
}

/// Where guest metadata comes from and how it is handed to the guest
///
/// Exactly one of `config_map_name` and `secret_name` must be set.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmMetadata {
    pub config_map_name: Option<String>,
    pub secret_name: Option<String>,
    pub transport: MetadataTransport,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum MetadataTransport {
    ExtraConfig,
    OvfEnv,
    #[serde(rename = "vAppConfig")]
    VAppConfig,
    CloudInit,
    Sysprep,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Probe {
    TcpSocket { port: u16, host: Option<String> },
    GuestHeartbeat { threshold: GuestHeartbeatThreshold },
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum GuestHeartbeatThreshold {
    Green,
    Yellow,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    pub phase: VmPhase,
    pub power_state: Option<PowerState>,
    pub host: Option<String>,
    pub vm_ip: Option<String>,
    pub unique_id: Option<String>,
    pub bios_uuid: Option<String>,
    pub instance_uuid: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeStatus>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    pub name: String,
    pub attached: bool,
    pub disk_uuid: Option<String>,
    pub error: Option<String>,
}

/// Convergence state of one declared volume
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeState {
    Pending,
    Attached,
    Failed,
}

impl VolumeStatus {
    pub fn pending(name: impl Into<String>) -> VolumeStatus {
        VolumeStatus {
            name: name.into(),
            attached: false,
            disk_uuid: None,
            error: None,
        }
    }

    pub fn state(&self) -> VolumeState {
        if self.attached {
            VolumeState::Attached
        } else if self.error.is_some() {
            VolumeState::Failed
        } else {
            VolumeState::Pending
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceStatus {
    pub connected: bool,
    pub mac_address: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

/// Hardware shape and resource policy for a family of machines
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClass {
    pub name: String,
    pub hardware: ClassHardware,
    #[serde(default)]
    pub policies: ClassPolicies,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassHardware {
    pub cpus: u32,
    pub memory_mib: u64,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassPolicies {
    pub resources: ResourceRequirements,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    pub requests: ResourceQuantities,
    pub limits: ResourceQuantities,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantities {
    pub cpu_mhz: Option<u64>,
    pub memory_mib: Option<u64>,
}

/// Grants a namespace access to a cluster-scoped class
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClassBinding {
    pub namespace: String,
    pub name: String,
    pub class_ref: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImage {
    pub name: String,
    /// name of the [`ContentLibraryProvider`] holding this image
    pub provider_ref: String,
    /// library item deployed when creating a machine from this image
    pub item_name: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentLibraryProvider {
    pub name: String,
    pub library_uuid: Uuid,
    /// name of the content source exposing this library
    pub content_source: String,
}

/// Grants a namespace access to a content source
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSourceBinding {
    pub namespace: String,
    pub name: String,
    pub content_source_ref: String,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, Ord, PartialEq,
    PartialOrd, Serialize,
)]
pub enum MetadataSourceKind {
    ConfigMap,
    Secret,
}

/// A config map or secret holding guest metadata
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSource {
    pub namespace: String,
    pub name: String,
    pub kind: MetadataSourceKind,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Scopes machines in a namespace to a child resource pool and folder
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSetResourcePolicy {
    pub namespace: String,
    pub name: String,
    pub resource_pool: String,
    pub folder: String,
}

/// External object that asks the storage layer to attach one volume to one
/// machine
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAttachment {
    pub namespace: String,
    pub name: String,
    pub vm_name: String,
    pub volume_name: String,
    pub claim_name: String,
    pub node_uuid: Option<String>,
    #[serde(default)]
    pub status: VolumeAttachmentStatus,
}

impl VolumeAttachment {
    /// Name of the attachment object for volume `volume_name` of machine
    /// `vm_name`.
    pub fn object_name(vm_name: &str, volume_name: &str) -> String {
        format!("{}-{}", vm_name, volume_name)
    }

    pub fn new(
        vm: &VirtualMachine,
        volume: &VolumeSpec,
        node_uuid: Option<&str>,
    ) -> VolumeAttachment {
        VolumeAttachment {
            namespace: vm.metadata.namespace.clone(),
            name: Self::object_name(&vm.metadata.name, &volume.name),
            vm_name: vm.metadata.name.clone(),
            volume_name: volume.name.clone(),
            claim_name: volume.claim_name.clone(),
            node_uuid: node_uuid.map(str::to_owned),
            status: VolumeAttachmentStatus::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAttachmentStatus {
    pub attached: bool,
    pub disk_uuid: Option<String>,
    pub error: Option<String>,
}
