// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume attachment through reconciliation passes

use crate::common::ControllerTestContext;
use crate::common::NAMESPACE;
use vmop_common::api::ConditionReason;
use vmop_common::api::ConditionType;
use vmop_common::api::VolumeSpec;
use vmop_common::api::VolumeState;
use vmop_controller::reconciler::Outcome;
use vmop_controller::sim::fixtures;

fn volume(name: &str) -> VolumeSpec {
    VolumeSpec { name: name.to_owned(), claim_name: format!("{name}-pvc") }
}

#[tokio::test]
async fn test_volumes_attach_over_several_passes() {
    let cptestctx =
        ControllerTestContext::new("test_volumes_attach_over_several_passes");
    let mut vm = fixtures::machine(NAMESPACE, "db-0");
    vm.spec.volumes = vec![volume("data"), volume("logs")];
    let key = cptestctx.declare(vm);

    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Requeue);
    let bios_uuid = cptestctx.machine(&key).status.bios_uuid.unwrap();
    let attachments = cptestctx.store.volume_attachments_of(NAMESPACE, "db-0");
    assert_eq!(attachments.len(), 2);
    assert!(attachments
        .iter()
        .all(|a| a.node_uuid.as_deref() == Some(bios_uuid.as_str())));
    assert_eq!(
        cptestctx.condition(&key, ConditionType::VolumesReady).unwrap().reason,
        Some(ConditionReason::VolumeAttachmentPending)
    );

    cptestctx.store.mark_attached(NAMESPACE, "db-0-data", "disk-1");
    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Requeue);
    let volumes = cptestctx.machine(&key).status.volumes;
    assert_eq!(volumes[0].state(), VolumeState::Attached);
    assert_eq!(volumes[1].state(), VolumeState::Pending);

    cptestctx.store.mark_attached(NAMESPACE, "db-0-logs", "disk-2");
    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    assert!(cptestctx
        .condition(&key, ConditionType::VolumesReady)
        .unwrap()
        .is_true());

    // Two attachment objects over the machine's whole life.
    assert_eq!(cptestctx.store.counters().attachment_creates, 2);
    assert_eq!(cptestctx.store.counters().attachment_deletes, 0);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_failed_attachment_is_reported() {
    let cptestctx =
        ControllerTestContext::new("test_failed_attachment_is_reported");
    let mut vm = fixtures::machine(NAMESPACE, "db-0");
    vm.spec.volumes = vec![volume("data")];
    let key = cptestctx.declare(vm);
    cptestctx.reconcile(&key).await.unwrap();

    cptestctx.store.mark_attachment_failed(
        NAMESPACE,
        "db-0-data",
        "claim data-pvc is not bound",
    );
    assert_eq!(cptestctx.reconcile(&key).await.unwrap(), Outcome::Done);
    let condition =
        cptestctx.condition(&key, ConditionType::VolumesReady).unwrap();
    assert_eq!(condition.reason, Some(ConditionReason::VolumeAttachmentFailed));
    assert_eq!(condition.message, "volumes failed to attach: data");
    let volumes = cptestctx.machine(&key).status.volumes;
    assert_eq!(
        volumes[0].error.as_deref(),
        Some("claim data-pvc is not bound")
    );

    cptestctx.teardown();
}

#[tokio::test]
async fn test_removed_volume_is_detached() {
    let cptestctx =
        ControllerTestContext::new("test_removed_volume_is_detached");
    let mut vm = fixtures::machine(NAMESPACE, "db-0");
    vm.spec.volumes = vec![volume("data"), volume("scratch")];
    let key = cptestctx.declare(vm);
    cptestctx.reconcile(&key).await.unwrap();

    let mut vm = cptestctx.machine(&key);
    vm.spec.volumes.retain(|v| v.name == "data");
    cptestctx.store.insert_vm(vm);
    cptestctx.reconcile(&key).await.unwrap();

    let attachments = cptestctx.store.volume_attachments_of(NAMESPACE, "db-0");
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].volume_name, "data");
    assert_eq!(cptestctx.machine(&key).status.volumes.len(), 1);

    cptestctx.teardown();
}
