// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canned objects for populating a [`SimStore`] and [`SimBackend`]

use super::SimBackend;
use super::SimStore;
use crate::backend::CreateSpec;
use crate::backend::Endpoint;
use crate::backend::ImageSource;
use crate::backend::InventoryPath;
use crate::backend::ObjectKind;
use crate::backend::ObjectRef;
use crate::backend::ResourceAllocation;
use crate::backend::VmConfig;
use crate::config::BackendConfig;
use std::time::Duration;
use uuid::Uuid;
use vmop_common::api::ClassHardware;
use vmop_common::api::ClassPolicies;
use vmop_common::api::ContentLibraryProvider;
use vmop_common::api::ContentSourceBinding;
use vmop_common::api::NetworkInterface;
use vmop_common::api::ObjectMeta;
use vmop_common::api::PowerState;
use vmop_common::api::ResourceQuantities;
use vmop_common::api::ResourceRequirements;
use vmop_common::api::VirtualMachine;
use vmop_common::api::VirtualMachineClass;
use vmop_common::api::VirtualMachineClassBinding;
use vmop_common::api::VirtualMachineImage;
use vmop_common::api::VirtualMachineSetResourcePolicy;
use vmop_common::api::VirtualMachineSpec;
use vmop_common::api::VirtualMachineStatus;

pub const CLASS_NAME: &str = "best-effort-small";
pub const IMAGE_NAME: &str = "ubuntu-22.04";
pub const IMAGE_ITEM: &str = "ubuntu-22.04-server-cloudimg";
pub const PROVIDER_NAME: &str = "cl-tkg";
pub const CONTENT_SOURCE: &str = "cs-tkg";
pub const LIBRARY_UUID: Uuid =
    Uuid::from_u128(0x6f1c_52d1_0f9e_4c3a_9d8e_2b4a_7c11_aa01);

pub fn backend_config() -> BackendConfig {
    BackendConfig {
        endpoint: Endpoint { host: String::from("vc.local"), port: 443 },
        inventory: InventoryPath {
            datacenter: String::from("dc-1"),
            cluster: String::from("cluster-1"),
        },
        call_timeout: Duration::from_secs(5),
        task_deadline: Duration::from_secs(60),
    }
}

pub fn class() -> VirtualMachineClass {
    VirtualMachineClass {
        name: String::from(CLASS_NAME),
        hardware: ClassHardware { cpus: 2, memory_mib: 4096 },
        policies: ClassPolicies {
            resources: ResourceRequirements {
                requests: ResourceQuantities {
                    cpu_mhz: Some(500),
                    memory_mib: None,
                },
                limits: ResourceQuantities::default(),
            },
        },
    }
}

/// Populate `store` with a class, an image, and its content library, all
/// usable from `namespace`.
pub fn seed_namespace(store: &SimStore, namespace: &str) {
    store.insert_class(class());
    store.insert_class_binding(VirtualMachineClassBinding {
        namespace: namespace.to_owned(),
        name: String::from(CLASS_NAME),
        class_ref: String::from(CLASS_NAME),
    });
    store.insert_image(VirtualMachineImage {
        name: String::from(IMAGE_NAME),
        provider_ref: String::from(PROVIDER_NAME),
        item_name: String::from(IMAGE_ITEM),
    });
    store.insert_provider(ContentLibraryProvider {
        name: String::from(PROVIDER_NAME),
        library_uuid: LIBRARY_UUID,
        content_source: String::from(CONTENT_SOURCE),
    });
    store.insert_content_source_binding(ContentSourceBinding {
        namespace: namespace.to_owned(),
        name: String::from(CONTENT_SOURCE),
        content_source_ref: String::from(CONTENT_SOURCE),
    });
}

/// A powered-on machine with one network interface and nothing optional
pub fn machine(namespace: &str, name: &str) -> VirtualMachine {
    VirtualMachine {
        metadata: ObjectMeta {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            uid: Uuid::new_v4(),
            generation: 1,
            ..Default::default()
        },
        spec: VirtualMachineSpec {
            image_name: String::from(IMAGE_NAME),
            class_name: String::from(CLASS_NAME),
            power_state: PowerState::PoweredOn,
            network_interfaces: vec![NetworkInterface {
                network_type: String::from("vsphere-distributed"),
                network_name: String::from("primary"),
                ethernet_card_type: Some(String::from("vmxnet3")),
            }],
            volumes: Vec::new(),
            vm_metadata: None,
            readiness_probe: None,
            resource_policy_name: None,
            storage_class: None,
        },
        status: VirtualMachineStatus::default(),
    }
}

/// A policy whose child pool and folder are named after it
pub fn resource_policy(
    namespace: &str,
    name: &str,
) -> VirtualMachineSetResourcePolicy {
    VirtualMachineSetResourcePolicy {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
        resource_pool: format!("{}-pool", name),
        folder: format!("{}-folder", name),
    }
}

/// Create `policy`'s child pool and folder on `backend`.
pub fn seed_policy_inventory(
    backend: &SimBackend,
    policy: &VirtualMachineSetResourcePolicy,
) {
    backend.add_child_pool(&policy.resource_pool);
    backend.add_child_folder(&policy.folder);
}

/// A create request for a bare machine in `backend`'s root pool and folder
pub fn create_spec(backend: &SimBackend, name: &str) -> CreateSpec {
    let inventory = backend.inventory();
    CreateSpec {
        name: name.to_owned(),
        folder: inventory.vm_folder,
        pool: inventory.resource_pool,
        host: Some(ObjectRef::new(ObjectKind::HostSystem, "host-1")),
        config: VmConfig {
            num_cpus: 2,
            memory_mib: 4096,
            cpu_allocation: ResourceAllocation::default(),
            memory_allocation: ResourceAllocation::default(),
            extra_config: Default::default(),
        },
        nics: Vec::new(),
        image: ImageSource {
            library_uuid: LIBRARY_UUID,
            item_name: String::from(IMAGE_ITEM),
        },
        metadata: None,
        storage_class: None,
    }
}
