// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving reconciliation from the work queue

use crate::common::ControllerTestContext;
use crate::common::NAMESPACE;
use std::sync::Arc;
use std::time::Duration;
use vmop_common::api::VmPhase;
use vmop_common::api::VolumeSpec;
use vmop_controller::config::ControllerConfig;
use vmop_controller::queue::Controller;
use vmop_controller::sim::fixtures;
use vmop_test_utils::dev::poll::wait_for_condition;
use vmop_test_utils::dev::poll::CondCheckError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const POLL_MAX: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_controller_converges_machines() {
    let cptestctx =
        ControllerTestContext::new("test_controller_converges_machines");
    let config = ControllerConfig {
        workers: 4,
        requeue_interval: Duration::from_millis(50),
        pass_deadline: Some(Duration::from_secs(30)),
    };
    let controller = Controller::new(
        &cptestctx.logctx.log,
        Arc::clone(&cptestctx.reconciler),
        config,
    );
    let queue = controller.queue();
    let handle = tokio::spawn(controller.run());

    let mut keys = Vec::new();
    for i in 0..6 {
        let mut vm = fixtures::machine(NAMESPACE, &format!("web-{i}"));
        vm.spec.volumes = vec![VolumeSpec {
            name: String::from("data"),
            claim_name: format!("web-{i}-data"),
        }];
        let key = cptestctx.declare(vm);
        queue.add(key.clone());
        keys.push(key);
    }

    // Every machine gets created, then keeps being requeued while its volume
    // is attaching.
    wait_for_condition(
        || async {
            let created = keys.iter().all(|key| {
                cptestctx.machine(key).status.phase == VmPhase::Created
            });
            if created {
                Ok(())
            } else {
                Err(CondCheckError::<()>::NotYet)
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();
    assert_eq!(cptestctx.backend.counters().creates, keys.len());

    for (i, key) in keys.iter().enumerate() {
        let attachment = format!("{}-data", key.name);
        let disk = format!("disk-{i}");
        cptestctx.store.mark_attached(NAMESPACE, &attachment, &disk);
    }
    wait_for_condition(
        || async {
            let attached = keys.iter().all(|key| {
                let volumes = cptestctx.machine(key).status.volumes;
                volumes.len() == 1 && volumes[0].attached
            });
            if attached {
                Ok(())
            } else {
                Err(CondCheckError::<()>::NotYet)
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();

    // Retriggering converged machines creates nothing new.
    for key in &keys {
        queue.add(key.clone());
    }
    wait_for_condition(
        || async {
            if queue.is_empty() {
                Ok(())
            } else {
                Err(CondCheckError::<()>::NotYet)
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();
    assert_eq!(cptestctx.backend.counters().creates, keys.len());
    assert_eq!(cptestctx.backend.counters().connects, 1);

    queue.shutdown();
    handle.await.unwrap().unwrap();
    cptestctx.teardown();
}
