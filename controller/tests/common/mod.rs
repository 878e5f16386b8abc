// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared setup for integration tests

use std::sync::Arc;
use vmop_common::api::find_condition;
use vmop_common::api::Condition;
use vmop_common::api::ConditionType;
use vmop_common::api::MachineKey;
use vmop_common::api::VirtualMachine;
use vmop_controller::config::BackendConfig;
use vmop_controller::reconciler::Outcome;
use vmop_controller::reconciler::ReconcileError;
use vmop_controller::reconciler::VirtualMachineReconciler;
use vmop_controller::session::SessionCache;
use vmop_controller::sim::fixtures;
use vmop_controller::sim::SimBackend;
use vmop_controller::sim::SimStore;
use vmop_test_utils::dev::test_setup_log;
use vmop_test_utils::dev::LogContext;

pub const NAMESPACE: &str = "ns";

/// A reconciler wired to a simulated store and backend
pub struct ControllerTestContext {
    pub logctx: LogContext,
    pub store: Arc<SimStore>,
    pub backend: SimBackend,
    pub sessions: Arc<SessionCache>,
    pub reconciler: Arc<VirtualMachineReconciler>,
}

impl ControllerTestContext {
    /// Set up a context whose store already holds everything a machine from
    /// [`fixtures::machine`] in [`NAMESPACE`] references.
    pub fn new(test_name: &str) -> ControllerTestContext {
        Self::with_backend_config(test_name, fixtures::backend_config())
    }

    pub fn with_backend_config(
        test_name: &str,
        config: BackendConfig,
    ) -> ControllerTestContext {
        let logctx = test_setup_log(test_name);
        let store = Arc::new(SimStore::new());
        fixtures::seed_namespace(&store, NAMESPACE);
        let backend = SimBackend::new(&logctx.log);
        let sessions = Arc::new(SessionCache::new(
            &logctx.log,
            Arc::new(backend.clone()),
            config,
        ));
        let reconciler = Arc::new(VirtualMachineReconciler::new(
            &logctx.log,
            store.clone(),
            Arc::clone(&sessions),
        ));
        ControllerTestContext { logctx, store, backend, sessions, reconciler }
    }

    /// Store `vm` and return its key.
    pub fn declare(&self, vm: VirtualMachine) -> MachineKey {
        let key = vm.key();
        self.store.insert_vm(vm);
        key
    }

    pub async fn reconcile(
        &self,
        key: &MachineKey,
    ) -> Result<Outcome, ReconcileError> {
        self.reconciler.reconcile(key).await
    }

    /// Returns the stored record for `key`, which must exist
    pub fn machine(&self, key: &MachineKey) -> VirtualMachine {
        self.store.vm(key).expect("machine should be in the store")
    }

    pub fn condition(
        &self,
        key: &MachineKey,
        condition_type: ConditionType,
    ) -> Option<Condition> {
        find_condition(&self.machine(key).status.conditions, condition_type)
            .cloned()
    }

    pub fn teardown(self) {
        self.logctx.cleanup_successful();
    }
}
