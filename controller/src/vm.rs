// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translating between declared machines and backend machines

use crate::backend::ConfigDelta;
use crate::backend::CreateSpec;
use crate::backend::GuestMetadata;
use crate::backend::ImageSource;
use crate::backend::NicSpec;
use crate::backend::ObjectRef;
use crate::backend::ResourceAllocation;
use crate::backend::VmConfig;
use crate::backend::VmProperties;
use crate::placement::Recommendation;
use crate::prereqs::Prerequisites;
use vmop_common::api::Error;
use vmop_common::api::MetadataTransport;
use vmop_common::api::PowerState;
use vmop_common::api::VirtualMachine;
use vmop_common::api::VirtualMachineStatus;
use vmop_common::api::VmPhase;

/// The configuration `vm` should have, given its resolved class and
/// metadata
pub fn desired_config(prereqs: &Prerequisites) -> VmConfig {
    let hardware = &prereqs.class.hardware;
    let resources = &prereqs.class.policies.resources;
    let extra_config = match &prereqs.metadata {
        Some(m) if m.transport == MetadataTransport::ExtraConfig => {
            m.data.clone()
        }
        _ => Default::default(),
    };
    VmConfig {
        num_cpus: hardware.cpus,
        memory_mib: hardware.memory_mib,
        cpu_allocation: ResourceAllocation {
            reservation: resources.requests.cpu_mhz,
            limit: resources.limits.cpu_mhz,
        },
        memory_allocation: ResourceAllocation {
            reservation: resources.requests.memory_mib,
            limit: resources.limits.memory_mib,
        },
        extra_config,
    }
}

/// Compute what has to change to take `live` to `desired`.
///
/// Extra config keys present on the live machine but not desired are left
/// alone; the backend and guest tools add their own.
pub fn config_delta(live: &VmConfig, desired: &VmConfig) -> ConfigDelta {
    fn changed<T: Clone + PartialEq>(live: &T, desired: &T) -> Option<T> {
        (live != desired).then(|| desired.clone())
    }

    ConfigDelta {
        num_cpus: changed(&live.num_cpus, &desired.num_cpus),
        memory_mib: changed(&live.memory_mib, &desired.memory_mib),
        cpu_allocation: changed(
            &live.cpu_allocation,
            &desired.cpu_allocation,
        ),
        memory_allocation: changed(
            &live.memory_allocation,
            &desired.memory_allocation,
        ),
        extra_config: desired
            .extra_config
            .iter()
            .filter(|(k, v)| live.extra_config.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

/// Build the create request for `vm` at `placement`.
pub fn create_spec(
    vm: &VirtualMachine,
    prereqs: &Prerequisites,
    config: VmConfig,
    folder: &ObjectRef,
    placement: Recommendation,
) -> CreateSpec {
    let nics = vm
        .spec
        .network_interfaces
        .iter()
        .map(|nic| NicSpec {
            network_type: nic.network_type.clone(),
            network_name: nic.network_name.clone(),
            card_type: nic.ethernet_card_type.clone(),
        })
        .collect();
    let metadata = prereqs
        .metadata
        .as_ref()
        .filter(|m| m.transport != MetadataTransport::ExtraConfig)
        .map(|m| GuestMetadata {
            transport: m.transport,
            data: m.data.clone(),
        });

    CreateSpec {
        name: vm.metadata.name.clone(),
        folder: folder.clone(),
        pool: placement.pool,
        host: Some(placement.host),
        config,
        nics,
        image: ImageSource {
            library_uuid: prereqs.provider.library_uuid,
            item_name: prereqs.image.item_name.clone(),
        },
        metadata,
        storage_class: vm.spec.storage_class.clone(),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerOp {
    PowerOn,
    PowerOff,
}

/// Reject desired power states the controller cannot drive a machine to.
pub fn validate_power_state(desired: PowerState) -> Result<(), Error> {
    match desired {
        PowerState::PoweredOn | PowerState::PoweredOff => Ok(()),
        PowerState::Suspended => Err(Error::invalid_value(
            "powerState",
            format!("invalid desired power state {}", desired),
        )),
    }
}

/// The power transition needed to take a machine from `current` to
/// `desired`, if any
pub fn power_transition(
    current: PowerState,
    desired: PowerState,
) -> Result<Option<PowerOp>, Error> {
    validate_power_state(desired)?;
    if current == desired {
        return Ok(None);
    }
    Ok(Some(match desired {
        PowerState::PoweredOn => PowerOp::PowerOn,
        PowerState::PoweredOff | PowerState::Suspended => PowerOp::PowerOff,
    }))
}

/// Copy what the backend reports about machine `vm_ref` into `status`.
pub fn apply_observed(
    vm_ref: &ObjectRef,
    props: &VmProperties,
    status: &mut VirtualMachineStatus,
) {
    status.phase = VmPhase::Created;
    status.power_state = Some(props.power_state);
    status.host = props.host.clone();
    status.vm_ip = match props.power_state {
        PowerState::PoweredOn => props.guest_ip.clone(),
        PowerState::PoweredOff | PowerState::Suspended => None,
    };
    status.unique_id = Some(vm_ref.value.clone());
    status.bios_uuid = props.bios_uuid.clone();
    status.instance_uuid = props.instance_uuid.clone();
    status.network_interfaces = props.nics.clone();
}
