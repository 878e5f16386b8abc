// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bringing new machines into existence

use crate::common::ControllerTestContext;
use crate::common::NAMESPACE;
use assert_matches::assert_matches;
use std::collections::BTreeMap;
use vmop_common::api::ConditionReason;
use vmop_common::api::ConditionStatus;
use vmop_common::api::ConditionType;
use vmop_common::api::Error;
use vmop_common::api::MetadataSource;
use vmop_common::api::MetadataSourceKind;
use vmop_common::api::MetadataTransport;
use vmop_common::api::PowerState;
use vmop_common::api::VmMetadata;
use vmop_common::api::VmPhase;
use vmop_common::api::PAUSE_RECONCILE_ANNOTATION;
use vmop_common::api::VM_FINALIZER;
use vmop_controller::backend::ObjectKind;
use vmop_controller::backend::ObjectRef;
use vmop_controller::backend::PlacementFault;
use vmop_controller::backend::PlacementResponse;
use vmop_controller::backend::PlacementTarget;
use vmop_controller::placement::PlacementError;
use vmop_controller::prereqs::PrereqError;
use vmop_controller::reconciler::Outcome;
use vmop_controller::reconciler::ReconcileError;
use vmop_controller::sim::fixtures;
use vmop_controller::sim::SimCall;

#[tokio::test]
async fn test_create_and_converge() {
    let cptestctx = ControllerTestContext::new("test_create_and_converge");
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));

    let outcome = cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(outcome, Outcome::Done);

    let counters = cptestctx.backend.counters();
    assert_eq!(counters.connects, 1);
    assert_eq!(counters.placements, 1);
    assert_eq!(counters.creates, 1);
    assert_eq!(counters.power_ons, 1);
    assert_eq!(counters.reconfigures, 0);

    let (vm_ref, props) = cptestctx.backend.vm("web-0").unwrap();
    assert_eq!(props.power_state, PowerState::PoweredOn);
    assert_eq!(props.config.num_cpus, 2);
    assert_eq!(props.config.memory_mib, 4096);
    assert_eq!(props.config.cpu_allocation.reservation, Some(500));

    let vm = cptestctx.machine(&key);
    assert!(vm.metadata.finalizers.iter().any(|f| f == VM_FINALIZER));
    let status = &vm.status;
    assert_eq!(status.phase, VmPhase::Created);
    assert_eq!(status.power_state, Some(PowerState::PoweredOn));
    assert_eq!(status.unique_id.as_deref(), Some(vm_ref.value.as_str()));
    assert_eq!(status.host.as_deref(), Some("host-1"));
    assert!(status.vm_ip.is_some());
    assert!(status.bios_uuid.is_some());
    assert_eq!(status.network_interfaces.len(), 1);
    for ty in [
        ConditionType::PrereqReady,
        ConditionType::Provisioned,
        ConditionType::VolumesReady,
    ] {
        assert!(cptestctx.condition(&key, ty).unwrap().is_true());
    }

    cptestctx.teardown();
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let cptestctx = ControllerTestContext::new("test_second_pass_is_a_no_op");
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));

    cptestctx.reconcile(&key).await.unwrap();
    let before = cptestctx.machine(&key);
    let counters_before = cptestctx.backend.counters();

    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    let after = cptestctx.machine(&key);
    let counters_after = cptestctx.backend.counters();

    // Same session, nothing created, reconfigured, or powered.
    assert_eq!(counters_after.connects, counters_before.connects);
    assert_eq!(counters_after.placements, counters_before.placements);
    assert_eq!(counters_after.creates, counters_before.creates);
    assert_eq!(counters_after.reconfigures, 0);
    assert_eq!(counters_after.power_ons, counters_before.power_ons);
    assert_eq!(counters_after.power_offs, 0);
    assert_eq!(after.status, before.status);
    assert_eq!(after.metadata.finalizers, before.metadata.finalizers);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_powered_off_machine_stays_off() {
    let cptestctx =
        ControllerTestContext::new("test_powered_off_machine_stays_off");
    let mut vm = fixtures::machine(NAMESPACE, "batch-0");
    vm.spec.power_state = PowerState::PoweredOff;
    let key = cptestctx.declare(vm);

    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(cptestctx.backend.counters().power_ons, 0);
    let status = cptestctx.machine(&key).status;
    assert_eq!(status.power_state, Some(PowerState::PoweredOff));
    assert_eq!(status.vm_ip, None);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_paused_machine_is_skipped() {
    let cptestctx =
        ControllerTestContext::new("test_paused_machine_is_skipped");
    let mut vm = fixtures::machine(NAMESPACE, "web-0");
    vm.metadata
        .annotations
        .insert(PAUSE_RECONCILE_ANNOTATION.to_owned(), String::new());
    let key = cptestctx.declare(vm.clone());

    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    assert_eq!(cptestctx.backend.counters().connects, 0);
    assert_eq!(cptestctx.store.counters().finalizer_writes, 0);
    assert_eq!(cptestctx.store.counters().status_writes, 0);
    assert_eq!(cptestctx.machine(&key), vm);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_missing_machine_is_done() {
    let cptestctx = ControllerTestContext::new("test_missing_machine_is_done");
    let key = fixtures::machine(NAMESPACE, "ghost").key();
    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    assert_eq!(cptestctx.backend.counters().connects, 0);
    cptestctx.teardown();
}

#[tokio::test]
async fn test_unresolvable_class_never_reaches_backend() {
    let cptestctx = ControllerTestContext::new(
        "test_unresolvable_class_never_reaches_backend",
    );
    let mut vm = fixtures::machine(NAMESPACE, "web-0");
    vm.spec.class_name = String::from("does-not-exist");
    let key = cptestctx.declare(vm);

    let error = cptestctx.reconcile(&key).await.unwrap_err();
    assert_matches!(
        error,
        ReconcileError::Precondition(PrereqError::ClassNotFound { .. })
    );
    assert!(error.is_precondition());
    assert_eq!(cptestctx.backend.counters().connects, 0);

    let condition =
        cptestctx.condition(&key, ConditionType::PrereqReady).unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, Some(ConditionReason::ClassNotFound));
    assert_eq!(
        condition.message,
        "Failed to get VirtualMachineClass: does-not-exist"
    );

    // Once the class shows up, the same machine converges.
    let mut class = fixtures::class();
    class.name = String::from("does-not-exist");
    cptestctx.store.insert_class(class);
    cptestctx.store.insert_class_binding(
        vmop_common::api::VirtualMachineClassBinding {
            namespace: String::from(NAMESPACE),
            name: String::from("does-not-exist"),
            class_ref: String::from("does-not-exist"),
        },
    );
    cptestctx.reconcile(&key).await.unwrap();
    assert!(cptestctx
        .condition(&key, ConditionType::PrereqReady)
        .unwrap()
        .is_true());

    cptestctx.teardown();
}

#[tokio::test]
async fn test_suspended_is_rejected_before_backend() {
    let cptestctx =
        ControllerTestContext::new("test_suspended_is_rejected_before_backend");
    let mut vm = fixtures::machine(NAMESPACE, "web-0");
    vm.spec.power_state = PowerState::Suspended;
    let key = cptestctx.declare(vm);

    let error = cptestctx.reconcile(&key).await.unwrap_err();
    assert_matches!(error, ReconcileError::InvalidSpec(_));
    assert!(error.is_precondition());
    assert_eq!(cptestctx.backend.counters().connects, 0);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_resource_policy_scopes_placement() {
    let cptestctx =
        ControllerTestContext::new("test_resource_policy_scopes_placement");
    let policy = fixtures::resource_policy(NAMESPACE, "tier-1");
    fixtures::seed_policy_inventory(&cptestctx.backend, &policy);
    cptestctx.store.insert_resource_policy(policy);

    let mut vm = fixtures::machine(NAMESPACE, "web-0");
    vm.spec.resource_policy_name = Some(String::from("tier-1"));
    let key = cptestctx.declare(vm);
    cptestctx.reconcile(&key).await.unwrap();

    let pool = ObjectRef::new(ObjectKind::ResourcePool, "resgroup-tier-1-pool");
    let requests = cptestctx.backend.placement_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].target,
        PlacementTarget::ResourcePools(vec![pool.clone()])
    );

    let spec = cptestctx.backend.create_spec_of("web-0").unwrap();
    assert_eq!(spec.pool, pool);
    assert_eq!(spec.folder.value, "group-tier-1-folder");

    cptestctx.teardown();
}

#[tokio::test]
async fn test_placement_faults_fail_the_pass() {
    let cptestctx =
        ControllerTestContext::new("test_placement_faults_fail_the_pass");
    cptestctx.backend.set_placement(PlacementResponse {
        recommendations: vec![],
        faults: vec![PlacementFault {
            pool: ObjectRef::new(ObjectKind::ResourcePool, "resgroup-9"),
            messages: vec![String::from("insufficient memory")],
        }],
    });
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));

    let error = cptestctx.reconcile(&key).await.unwrap_err();
    assert_matches!(
        error,
        ReconcileError::Placement(PlacementError::Faulted(_))
    );
    assert!(error.is_precondition());
    assert!(!error.invalidates_session());
    assert_eq!(cptestctx.backend.counters().creates, 0);

    let condition =
        cptestctx.condition(&key, ConditionType::Provisioned).unwrap();
    assert_eq!(condition.reason, Some(ConditionReason::PlacementFaulted));
    assert_eq!(
        condition.message,
        "ResourcePool resgroup-9 faults: insufficient memory"
    );
    assert_eq!(cptestctx.machine(&key).status.phase, VmPhase::Creating);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_empty_placement_fails_the_pass() {
    let cptestctx =
        ControllerTestContext::new("test_empty_placement_fails_the_pass");
    cptestctx.backend.set_placement(PlacementResponse::default());
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));

    let error = cptestctx.reconcile(&key).await.unwrap_err();
    assert_matches!(
        error,
        ReconcileError::Placement(PlacementError::NoValidPlacement)
    );
    assert_eq!(
        cptestctx.condition(&key, ConditionType::Provisioned).unwrap().reason,
        Some(ConditionReason::NoPlacementFound)
    );
    assert_eq!(cptestctx.backend.counters().creates, 0);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_failed_create_task_is_retried() {
    let cptestctx =
        ControllerTestContext::new("test_failed_create_task_is_retried");
    cptestctx
        .backend
        .fail_next_task(SimCall::CreateVm, "insufficient resources");
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));

    let error = cptestctx.reconcile(&key).await.unwrap_err();
    assert_matches!(error, ReconcileError::Backend(_));
    assert!(!error.is_precondition());
    let condition =
        cptestctx.condition(&key, ConditionType::Provisioned).unwrap();
    assert_eq!(condition.reason, Some(ConditionReason::BackendError));
    assert!(condition.message.contains("insufficient resources"));
    assert!(cptestctx.backend.vm("web-0").is_none());

    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(cptestctx.backend.counters().creates, 2);
    assert!(cptestctx
        .condition(&key, ConditionType::Provisioned)
        .unwrap()
        .is_true());

    cptestctx.teardown();
}

#[tokio::test]
async fn test_failed_power_on_still_records_machine() {
    let cptestctx = ControllerTestContext::new(
        "test_failed_power_on_still_records_machine",
    );
    cptestctx.backend.inject_fault(
        SimCall::PowerOn,
        Error::internal_error("host entering maintenance"),
    );
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));

    let error = cptestctx.reconcile(&key).await.unwrap_err();
    assert_matches!(
        error,
        ReconcileError::Backend(Error::InternalError { .. })
    );

    // The create went through, so the status points at the new machine.
    let (vm_ref, props) = cptestctx.backend.vm("web-0").unwrap();
    let status = cptestctx.machine(&key).status;
    assert_eq!(status.phase, VmPhase::Created);
    assert_eq!(status.unique_id.as_deref(), Some(vm_ref.value.as_str()));
    assert_eq!(status.bios_uuid, props.bios_uuid);
    assert_eq!(status.power_state, Some(PowerState::PoweredOff));

    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(cptestctx.backend.counters().creates, 1);
    assert_eq!(
        cptestctx.machine(&key).status.power_state,
        Some(PowerState::PoweredOn)
    );

    cptestctx.teardown();
}

#[tokio::test]
async fn test_guest_metadata_transports() {
    let cptestctx =
        ControllerTestContext::new("test_guest_metadata_transports");
    cptestctx.store.insert_metadata_source(MetadataSource {
        namespace: String::from(NAMESPACE),
        name: String::from("guest-md"),
        kind: MetadataSourceKind::ConfigMap,
        data: BTreeMap::from([(
            String::from("guestinfo.hostname"),
            String::from("web"),
        )]),
    });

    let mut extra = fixtures::machine(NAMESPACE, "web-extra");
    extra.spec.vm_metadata = Some(VmMetadata {
        config_map_name: Some(String::from("guest-md")),
        secret_name: None,
        transport: MetadataTransport::ExtraConfig,
    });
    let mut cloud_init = fixtures::machine(NAMESPACE, "web-ci");
    cloud_init.spec.vm_metadata = Some(VmMetadata {
        config_map_name: Some(String::from("guest-md")),
        secret_name: None,
        transport: MetadataTransport::CloudInit,
    });
    let extra = cptestctx.declare(extra);
    let cloud_init = cptestctx.declare(cloud_init);
    cptestctx.reconcile(&extra).await.unwrap();
    cptestctx.reconcile(&cloud_init).await.unwrap();

    let spec = cptestctx.backend.create_spec_of("web-extra").unwrap();
    assert_eq!(spec.config.extra_config["guestinfo.hostname"], "web");
    assert!(spec.metadata.is_none());

    let spec = cptestctx.backend.create_spec_of("web-ci").unwrap();
    assert!(spec.config.extra_config.is_empty());
    let metadata = spec.metadata.unwrap();
    assert_eq!(metadata.transport, MetadataTransport::CloudInit);
    assert_eq!(metadata.data["guestinfo.hostname"], "web");

    cptestctx.teardown();
}
