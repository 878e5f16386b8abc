// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Correcting machines that changed on the backend

use crate::common::ControllerTestContext;
use crate::common::NAMESPACE;
use vmop_common::api::Error;
use vmop_common::api::PowerState;
use vmop_controller::backend::ConfigDelta;
use vmop_controller::reconciler::Outcome;
use vmop_controller::sim::fixtures;
use vmop_controller::sim::SimCall;

#[tokio::test]
async fn test_config_drift_is_corrected() {
    let cptestctx =
        ControllerTestContext::new("test_config_drift_is_corrected");
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));
    cptestctx.reconcile(&key).await.unwrap();

    let (vm_ref, props) = cptestctx.backend.vm("web-0").unwrap();
    let mut drifted = props.config.clone();
    drifted.memory_mib = 8192;
    drifted.extra_config.insert(
        String::from("tools.guest.desktop.autolock"),
        String::from("1"),
    );
    cptestctx.backend.set_vm_config("web-0", drifted);

    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    // Only the drifted field is sent; keys the backend added are kept.
    assert_eq!(
        cptestctx.backend.reconfigures(),
        vec![(
            vm_ref,
            ConfigDelta { memory_mib: Some(4096), ..Default::default() }
        )]
    );
    let (_, props) = cptestctx.backend.vm("web-0").unwrap();
    assert_eq!(props.config.memory_mib, 4096);
    assert!(props
        .config
        .extra_config
        .contains_key("tools.guest.desktop.autolock"));

    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(cptestctx.backend.counters().reconfigures, 1);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_class_change_is_applied() {
    let cptestctx = ControllerTestContext::new("test_class_change_is_applied");
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));
    cptestctx.reconcile(&key).await.unwrap();

    let mut class = fixtures::class();
    class.hardware.cpus = 4;
    cptestctx.store.insert_class(class);
    cptestctx.reconcile(&key).await.unwrap();

    let reconfigures = cptestctx.backend.reconfigures();
    assert_eq!(reconfigures.len(), 1);
    assert_eq!(
        reconfigures[0].1,
        ConfigDelta { num_cpus: Some(4), ..Default::default() }
    );
    // Reconfiguring an existing machine never goes back through placement.
    assert_eq!(cptestctx.backend.counters().placements, 1);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_power_drift_is_corrected() {
    let cptestctx = ControllerTestContext::new("test_power_drift_is_corrected");
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));
    cptestctx.reconcile(&key).await.unwrap();

    cptestctx.backend.set_power_state("web-0", PowerState::PoweredOff);
    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(cptestctx.backend.counters().power_ons, 2);
    assert_eq!(
        cptestctx.machine(&key).status.power_state,
        Some(PowerState::PoweredOn)
    );

    // Declaring the machine off powers it off.
    let mut vm = cptestctx.machine(&key);
    vm.spec.power_state = PowerState::PoweredOff;
    cptestctx.store.insert_vm(vm);
    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(cptestctx.backend.counters().power_offs, 1);
    let status = cptestctx.machine(&key).status;
    assert_eq!(status.power_state, Some(PowerState::PoweredOff));
    assert_eq!(status.vm_ip, None);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_failed_power_on_reports_observed_state() {
    let cptestctx = ControllerTestContext::new(
        "test_failed_power_on_reports_observed_state",
    );
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));
    cptestctx.reconcile(&key).await.unwrap();

    let (_, props) = cptestctx.backend.vm("web-0").unwrap();
    let mut drifted = props.config.clone();
    drifted.num_cpus = 8;
    cptestctx.backend.set_vm_config("web-0", drifted);
    cptestctx.backend.set_power_state("web-0", PowerState::PoweredOff);
    cptestctx.backend.inject_fault(
        SimCall::PowerOn,
        Error::internal_error("host entering maintenance"),
    );

    cptestctx.reconcile(&key).await.unwrap_err();
    assert_eq!(cptestctx.backend.counters().reconfigures, 1);
    let status = cptestctx.machine(&key).status;
    assert_eq!(status.power_state, Some(PowerState::PoweredOff));
    assert_eq!(status.vm_ip, None);

    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(
        cptestctx.machine(&key).status.power_state,
        Some(PowerState::PoweredOn)
    );
    assert_eq!(cptestctx.backend.counters().reconfigures, 1);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_adopts_existing_backend_machine() {
    let cptestctx =
        ControllerTestContext::new("test_adopts_existing_backend_machine");
    let (_, template) = {
        // Build a machine through the controller, then copy its properties
        // onto one that exists before the controller has seen it.
        let key = cptestctx.declare(fixtures::machine(NAMESPACE, "template"));
        cptestctx.reconcile(&key).await.unwrap();
        cptestctx.backend.vm("template").unwrap()
    };
    let vm_ref = cptestctx.backend.insert_vm("web-0", template);

    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));
    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(cptestctx.backend.counters().creates, 1);
    assert_eq!(
        cptestctx.machine(&key).status.unique_id.as_deref(),
        Some(vm_ref.value.as_str())
    );

    cptestctx.teardown();
}
