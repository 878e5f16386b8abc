// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-machine reconciliation state machine
//!
//! Every pass is level-triggered: it re-reads the machine from the store,
//! looks at what exists on the backend, and issues only the mutations needed
//! to close the gap.  Nothing is remembered between passes, so a pass that
//! was interrupted is simply finished by the next one.

use crate::backend::ObjectRef;
use crate::backend::PlacementCandidate;
use crate::backend::PlacementTarget;
use crate::backend::VmConfig;
use crate::backend::VmProperties;
use crate::placement;
use crate::placement::PlacementError;
use crate::prereqs;
use crate::prereqs::PrereqError;
use crate::prereqs::Prerequisites;
use crate::queue::Reconcile;
use crate::session::Session;
use crate::session::SessionCache;
use crate::store::Store;
use crate::vm;
use crate::vm::PowerOp;
use crate::volumes::VolumeOrchestrator;
use async_trait::async_trait;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use vmop_common::api::set_condition;
use vmop_common::api::Condition;
use vmop_common::api::ConditionReason;
use vmop_common::api::ConditionSeverity;
use vmop_common::api::ConditionType;
use vmop_common::api::Error;
use vmop_common::api::MachineKey;
use vmop_common::api::PowerState;
use vmop_common::api::VirtualMachine;
use vmop_common::api::VirtualMachineStatus;
use vmop_common::api::VmPhase;
use vmop_common::api::VolumeState;
use vmop_common::api::VolumeStatus;
use vmop_common::api::PAUSE_RECONCILE_ANNOTATION;
use vmop_common::api::VM_FINALIZER;

/// What should happen after a successful pass
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// the machine is converged; wait for the next trigger
    Done,
    /// progress is still being made asynchronously; look again shortly
    Requeue,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Precondition(#[from] PrereqError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error("invalid machine spec: {0}")]
    InvalidSpec(Error),

    #[error("backend operation failed: {0}")]
    Backend(Error),

    #[error("store operation failed: {0}")]
    Store(Error),

    #[error("reconciliation pass exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl ReconcileError {
    /// Returns whether retrying can only help once the declared machine or
    /// the objects it references change
    pub fn is_precondition(&self) -> bool {
        match self {
            ReconcileError::Precondition(PrereqError::Store(_)) => false,
            ReconcileError::Precondition(_) => true,
            ReconcileError::Placement(e) => e.backend_error().is_none(),
            ReconcileError::InvalidSpec(_) => true,
            ReconcileError::Backend(_)
            | ReconcileError::Store(_)
            | ReconcileError::DeadlineExceeded(_) => false,
        }
    }

    /// Returns whether the session used for the pass should be discarded
    pub fn invalidates_session(&self) -> bool {
        match self {
            ReconcileError::Backend(e) => e.invalidates_session(),
            ReconcileError::Placement(e) => {
                e.backend_error().is_some_and(Error::invalidates_session)
            }
            ReconcileError::Precondition(_)
            | ReconcileError::InvalidSpec(_)
            | ReconcileError::Store(_)
            | ReconcileError::DeadlineExceeded(_) => false,
        }
    }
}

pub struct VirtualMachineReconciler {
    log: Logger,
    store: Arc<dyn Store>,
    sessions: Arc<SessionCache>,
    volumes: VolumeOrchestrator,
}

impl VirtualMachineReconciler {
    pub fn new(
        log: &Logger,
        store: Arc<dyn Store>,
        sessions: Arc<SessionCache>,
    ) -> VirtualMachineReconciler {
        let log = log.new(o!("component" => "VirtualMachineReconciler"));
        let volumes = VolumeOrchestrator::new(&log, Arc::clone(&store));
        VirtualMachineReconciler { log, store, sessions, volumes }
    }

    /// Run one reconciliation pass for the machine identified by `key`.
    pub async fn reconcile(
        &self,
        key: &MachineKey,
    ) -> Result<Outcome, ReconcileError> {
        let log = self.log.new(o!("vm" => key.to_string()));

        let vm = match self.store.virtual_machine(key).await {
            Ok(vm) => vm,
            Err(e) if e.is_not_found() => {
                debug!(log, "machine not found");
                return Ok(Outcome::Done);
            }
            Err(e) => return Err(ReconcileError::Store(e)),
        };

        if vm.is_paused() {
            info!(log, "skipping paused machine";
                "annotation" => PAUSE_RECONCILE_ANNOTATION,
            );
            return Ok(Outcome::Done);
        }

        let result = if vm.is_deleting() {
            self.reconcile_delete(&log, vm).await
        } else {
            self.reconcile_normal(&log, vm).await
        };

        if let Err(error) = &result {
            if error.invalidates_session() {
                warn!(log, "discarding session after backend fault";
                    "error" => %error,
                );
                self.sessions.invalidate(&key.namespace).await;
            }
        }
        result
    }

    async fn reconcile_delete(
        &self,
        log: &Logger,
        vm: VirtualMachine,
    ) -> Result<Outcome, ReconcileError> {
        if !vm.has_finalizer() {
            return Ok(Outcome::Done);
        }
        let key = vm.key();

        if vm.status.phase != VmPhase::Deleting {
            let mut status = vm.status.clone();
            status.phase = VmPhase::Deleting;
            self.store
                .update_status(&key, &status)
                .await
                .map_err(ReconcileError::Store)?;
        }

        let session = self
            .sessions
            .get(&key.namespace)
            .await
            .map_err(ReconcileError::Backend)?;
        self.delete_backend_vm(log, &session, &key.name)
            .await
            .map_err(ReconcileError::Backend)?;
        let removed =
            self.volumes.remove_all(&vm).await.map_err(ReconcileError::Store)?;

        let finalizers: Vec<String> = vm
            .metadata
            .finalizers
            .iter()
            .filter(|f| f.as_str() != VM_FINALIZER)
            .cloned()
            .collect();
        match self.store.update_finalizers(&key, &finalizers).await {
            Ok(_) => (),
            Err(e) if e.is_not_found() => (),
            Err(e) => return Err(ReconcileError::Store(e)),
        }
        info!(log, "machine deleted"; "attachments_removed" => removed);
        Ok(Outcome::Done)
    }

    /// Tear down the backend machine named `name`, if it exists.
    async fn delete_backend_vm(
        &self,
        log: &Logger,
        session: &Session,
        name: &str,
    ) -> Result<(), Error> {
        let Some(vm_ref) = not_found_ok(session.find_vm(name).await)? else {
            info!(log, "backend machine already gone");
            return Ok(());
        };
        let Some(props) = not_found_ok(session.vm_properties(&vm_ref).await)?
        else {
            return Ok(());
        };

        if props.power_state != PowerState::PoweredOff {
            info!(log, "powering off before destroy";
                "power_state" => %props.power_state,
            );
            if not_found_ok(session.power_off(&vm_ref).await)?.is_none() {
                return Ok(());
            }
        }

        info!(log, "destroying backend machine"; "vm_ref" => %vm_ref);
        not_found_ok(session.destroy_vm(&vm_ref).await)?;
        Ok(())
    }

    async fn reconcile_normal(
        &self,
        log: &Logger,
        vm: VirtualMachine,
    ) -> Result<Outcome, ReconcileError> {
        let key = vm.key();
        let vm = if vm.has_finalizer() {
            vm
        } else {
            info!(log, "adding finalizer");
            let mut finalizers = vm.metadata.finalizers.clone();
            finalizers.push(VM_FINALIZER.to_owned());
            self.store
                .update_finalizers(&key, &finalizers)
                .await
                .map_err(ReconcileError::Store)?
        };

        let mut status = vm.status.clone();
        let result = self.converge(log, &vm, &mut status).await;

        // Written whether or not the pass succeeded, so that partial
        // progress and failure conditions are visible.
        let persisted = self.store.update_status(&key, &status).await;
        match (result, persisted) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(ReconcileError::Store(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(persist_error)) => {
                warn!(log, "failed to persist status after failed pass";
                    "error" => %persist_error,
                );
                Err(e)
            }
        }
    }

    async fn converge(
        &self,
        log: &Logger,
        vm: &VirtualMachine,
        status: &mut VirtualMachineStatus,
    ) -> Result<Outcome, ReconcileError> {
        let prereqs = match prereqs::resolve(self.store.as_ref(), vm).await {
            Ok(prereqs) => prereqs,
            Err(e) => {
                if let Some(condition) = e.condition() {
                    warn!(log, "unresolved prerequisite"; "error" => %e);
                    set_condition(&mut status.conditions, condition);
                }
                return Err(e.into());
            }
        };
        set_condition(
            &mut status.conditions,
            Condition::ready(ConditionType::PrereqReady),
        );
        vm::validate_power_state(vm.spec.power_state)
            .map_err(ReconcileError::InvalidSpec)?;

        let session = self
            .sessions
            .get(&vm.metadata.namespace)
            .await
            .map_err(ReconcileError::Backend)?;
        let desired = vm::desired_config(&prereqs);

        match session.find_vm(&vm.metadata.name).await {
            Ok(vm_ref) => {
                self.update_vm(log, &session, vm, &vm_ref, desired, status)
                    .await?
            }
            Err(e) if e.is_not_found() => {
                self.create_vm(log, &session, vm, &prereqs, desired, status)
                    .await?
            }
            Err(e) => return Err(ReconcileError::Backend(e)),
        }

        let volumes = self
            .volumes
            .converge(&session, vm, status.bios_uuid.as_deref())
            .await
            .map_err(ReconcileError::Store)?;
        set_condition(
            &mut status.conditions,
            volumes_condition(&volumes.statuses),
        );
        status.volumes = volumes.statuses;
        Ok(volumes.outcome)
    }

    async fn create_vm(
        &self,
        log: &Logger,
        session: &Session,
        vm: &VirtualMachine,
        prereqs: &Prerequisites,
        config: VmConfig,
        status: &mut VirtualMachineStatus,
    ) -> Result<(), ReconcileError> {
        status.phase = VmPhase::Creating;

        let (target, folder) = placement_scope(session, prereqs)
            .await
            .map_err(ReconcileError::Backend)?;
        let candidate = PlacementCandidate {
            name: vm.metadata.name.clone(),
            config: config.clone(),
            storage_class: vm.spec.storage_class.clone(),
        };
        let recommendation =
            match placement::resolve(log, session, &target, &candidate)
                .await
                .and_then(placement::choose)
            {
                Ok(recommendation) => recommendation,
                Err(e) => {
                    warn!(log, "placement failed"; "error" => %e);
                    set_condition(
                        &mut status.conditions,
                        placement_condition(&e),
                    );
                    return Err(e.into());
                }
            };

        info!(log, "creating machine";
            "pool" => %recommendation.pool,
            "host" => %recommendation.host,
            "folder" => %folder,
        );
        let spec =
            vm::create_spec(vm, prereqs, config, &folder, recommendation);
        let vm_ref = match session.create_vm(&spec).await {
            Ok(vm_ref) => vm_ref,
            Err(e) => {
                set_condition(
                    &mut status.conditions,
                    Condition::failed(
                        ConditionType::Provisioned,
                        ConditionReason::BackendError,
                        ConditionSeverity::Warning,
                        e.to_string(),
                    ),
                );
                return Err(ReconcileError::Backend(e));
            }
        };
        set_condition(
            &mut status.conditions,
            Condition::ready(ConditionType::Provisioned),
        );

        let props = session
            .vm_properties(&vm_ref)
            .await
            .map_err(ReconcileError::Backend)?;
        // The machine exists from here on, even if the power transition
        // below fails.
        vm::apply_observed(&vm_ref, &props, status);
        let props = self
            .converge_power(log, session, &vm_ref, props, vm.spec.power_state)
            .await?;
        vm::apply_observed(&vm_ref, &props, status);
        Ok(())
    }

    async fn update_vm(
        &self,
        log: &Logger,
        session: &Session,
        vm: &VirtualMachine,
        vm_ref: &ObjectRef,
        desired: VmConfig,
        status: &mut VirtualMachineStatus,
    ) -> Result<(), ReconcileError> {
        let props = session
            .vm_properties(vm_ref)
            .await
            .map_err(ReconcileError::Backend)?;

        let delta = vm::config_delta(&props.config, &desired);
        let props = if delta.is_empty() {
            props
        } else {
            info!(log, "reconfiguring machine"; "delta" => ?delta);
            session
                .reconfigure_vm(vm_ref, &delta)
                .await
                .map_err(ReconcileError::Backend)?;
            session
                .vm_properties(vm_ref)
                .await
                .map_err(ReconcileError::Backend)?
        };
        vm::apply_observed(vm_ref, &props, status);

        let props = self
            .converge_power(log, session, vm_ref, props, vm.spec.power_state)
            .await?;
        set_condition(
            &mut status.conditions,
            Condition::ready(ConditionType::Provisioned),
        );
        vm::apply_observed(vm_ref, &props, status);
        Ok(())
    }

    /// Issue a power transition if the machine is not already in `desired`,
    /// returning the machine's properties afterwards.
    async fn converge_power(
        &self,
        log: &Logger,
        session: &Session,
        vm_ref: &ObjectRef,
        props: VmProperties,
        desired: PowerState,
    ) -> Result<VmProperties, ReconcileError> {
        let Some(op) = vm::power_transition(props.power_state, desired)
            .map_err(ReconcileError::InvalidSpec)?
        else {
            return Ok(props);
        };

        info!(log, "changing power state";
            "from" => %props.power_state,
            "to" => %desired,
        );
        let result = match op {
            PowerOp::PowerOn => session.power_on(vm_ref).await,
            PowerOp::PowerOff => session.power_off(vm_ref).await,
        };
        result.map_err(ReconcileError::Backend)?;
        session.vm_properties(vm_ref).await.map_err(ReconcileError::Backend)
    }
}

#[async_trait]
impl Reconcile for VirtualMachineReconciler {
    async fn reconcile(
        &self,
        key: &MachineKey,
    ) -> Result<Outcome, ReconcileError> {
        VirtualMachineReconciler::reconcile(self, key).await
    }
}

/// Where a new machine may be placed, and the folder it is created in
///
/// A resource policy narrows placement to its child pool and folder;
/// otherwise the whole session cluster is eligible.
async fn placement_scope(
    session: &Session,
    prereqs: &Prerequisites,
) -> Result<(PlacementTarget, ObjectRef), Error> {
    let inventory = session.inventory();
    match &prereqs.resource_policy {
        None => Ok((
            PlacementTarget::Cluster(inventory.cluster.clone()),
            inventory.vm_folder.clone(),
        )),
        Some(policy) => {
            let pool = session.find_child_pool(&policy.resource_pool).await?;
            let folder = session.find_child_folder(&policy.folder).await?;
            Ok((PlacementTarget::ResourcePools(vec![pool]), folder))
        }
    }
}

fn not_found_ok<T>(result: Result<T, Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn placement_condition(error: &PlacementError) -> Condition {
    let (reason, severity) = match error {
        PlacementError::NoValidPlacement => {
            (ConditionReason::NoPlacementFound, ConditionSeverity::Error)
        }
        PlacementError::Faulted(_) => {
            (ConditionReason::PlacementFaulted, ConditionSeverity::Error)
        }
        PlacementError::Backend(_) => {
            (ConditionReason::BackendError, ConditionSeverity::Warning)
        }
    };
    Condition::failed(
        ConditionType::Provisioned,
        reason,
        severity,
        error.to_string(),
    )
}

fn volumes_condition(statuses: &[VolumeStatus]) -> Condition {
    let failed: Vec<&str> = statuses
        .iter()
        .filter(|s| s.state() == VolumeState::Failed)
        .map(|s| s.name.as_str())
        .collect();
    let pending = statuses
        .iter()
        .filter(|s| s.state() == VolumeState::Pending)
        .count();

    if !failed.is_empty() {
        Condition::failed(
            ConditionType::VolumesReady,
            ConditionReason::VolumeAttachmentFailed,
            ConditionSeverity::Error,
            format!("volumes failed to attach: {}", failed.join(", ")),
        )
    } else if pending > 0 {
        Condition::failed(
            ConditionType::VolumesReady,
            ConditionReason::VolumeAttachmentPending,
            ConditionSeverity::Info,
            format!("{} of {} volumes attaching", pending, statuses.len()),
        )
    } else {
        Condition::ready(ConditionType::VolumesReady)
    }
}
