// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tearing machines down

use crate::common::ControllerTestContext;
use crate::common::NAMESPACE;
use assert_matches::assert_matches;
use vmop_common::api::Error;
use vmop_common::api::PowerState;
use vmop_common::api::VolumeSpec;
use vmop_common::api::VM_FINALIZER;
use vmop_controller::reconciler::Outcome;
use vmop_controller::reconciler::ReconcileError;
use vmop_controller::sim::fixtures;
use vmop_controller::sim::SimCall;

#[tokio::test]
async fn test_delete_powers_off_and_destroys() {
    let cptestctx =
        ControllerTestContext::new("test_delete_powers_off_and_destroys");
    let mut vm = fixtures::machine(NAMESPACE, "db-0");
    vm.spec.volumes = vec![VolumeSpec {
        name: String::from("data"),
        claim_name: String::from("data-pvc"),
    }];
    let key = cptestctx.declare(vm);

    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Requeue);
    assert_eq!(
        cptestctx.store.volume_attachments_of(NAMESPACE, "db-0").len(),
        1
    );
    let (_, props) = cptestctx.backend.vm("db-0").unwrap();
    assert_eq!(props.power_state, PowerState::PoweredOn);

    cptestctx.store.mark_deleting(&key);
    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);

    let counters = cptestctx.backend.counters();
    assert_eq!(counters.power_offs, 1);
    assert_eq!(counters.destroys, 1);
    assert!(cptestctx.backend.vm("db-0").is_none());
    assert!(cptestctx
        .store
        .volume_attachments_of(NAMESPACE, "db-0")
        .is_empty());
    // With the finalizer gone, the store let the record go.
    assert!(cptestctx.store.vm(&key).is_none());

    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    assert_eq!(cptestctx.backend.counters().destroys, 1);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_delete_of_powered_off_machine() {
    let cptestctx =
        ControllerTestContext::new("test_delete_of_powered_off_machine");
    let mut vm = fixtures::machine(NAMESPACE, "web-0");
    vm.spec.power_state = PowerState::PoweredOff;
    let key = cptestctx.declare(vm);
    cptestctx.reconcile(&key).await.unwrap();

    cptestctx.store.mark_deleting(&key);
    cptestctx.reconcile(&key).await.unwrap();
    let counters = cptestctx.backend.counters();
    assert_eq!(counters.power_offs, 0);
    assert_eq!(counters.destroys, 1);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_delete_never_creates() {
    let cptestctx = ControllerTestContext::new("test_delete_never_creates");
    let mut vm = fixtures::machine(NAMESPACE, "web-0");
    vm.metadata.finalizers.push(VM_FINALIZER.to_owned());
    // Prerequisites are irrelevant to deletion.
    vm.spec.image_name = String::from("gone");
    let key = cptestctx.declare(vm);
    cptestctx.store.mark_deleting(&key);

    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    let counters = cptestctx.backend.counters();
    assert_eq!(counters.placements, 0);
    assert_eq!(counters.creates, 0);
    assert_eq!(counters.destroys, 0);
    assert!(cptestctx.store.vm(&key).is_none());

    cptestctx.teardown();
}

#[tokio::test]
async fn test_delete_keeps_other_finalizers() {
    let cptestctx =
        ControllerTestContext::new("test_delete_keeps_other_finalizers");
    let mut vm = fixtures::machine(NAMESPACE, "web-0");
    vm.metadata.finalizers =
        vec![String::from("example.com/backup"), VM_FINALIZER.to_owned()];
    let key = cptestctx.declare(vm);
    cptestctx.store.mark_deleting(&key);

    cptestctx.reconcile(&key).await.unwrap();
    let vm = cptestctx.machine(&key);
    assert_eq!(
        vm.metadata.finalizers,
        vec![String::from("example.com/backup")]
    );

    // Not ours any more: later passes leave it alone.
    let writes = cptestctx.store.counters();
    cptestctx.reconcile(&key).await.unwrap();
    assert_eq!(cptestctx.store.counters(), writes);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_failed_destroy_keeps_finalizer() {
    let cptestctx =
        ControllerTestContext::new("test_failed_destroy_keeps_finalizer");
    let key = cptestctx.declare(fixtures::machine(NAMESPACE, "web-0"));
    cptestctx.reconcile(&key).await.unwrap();
    cptestctx.store.mark_deleting(&key);

    cptestctx.backend.inject_fault(
        SimCall::DestroyVm,
        Error::internal_error("datastore unreachable"),
    );
    let error = cptestctx.reconcile(&key).await.unwrap_err();
    assert_matches!(error, ReconcileError::Backend(_));
    assert!(cptestctx.machine(&key).has_finalizer());
    assert!(cptestctx.backend.vm("web-0").is_some());

    // The machine is already off; the retry only has to destroy it.
    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    assert_eq!(cptestctx.backend.counters().power_offs, 1);
    assert!(cptestctx.backend.vm("web-0").is_none());
    assert!(cptestctx.store.vm(&key).is_none());

    cptestctx.teardown();
}
