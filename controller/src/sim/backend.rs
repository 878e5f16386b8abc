// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated virtualization backend
//!
//! Mutations take effect as soon as they are issued; the task handed back
//! only models latency (see [`SimBackend::set_task_polls`]) and failure (see
//! [`SimBackend::fail_next_task`]).  A failed task leaves the inventory
//! untouched.

use crate::backend::BackendClient;
use crate::backend::BackendRecommendation;
use crate::backend::ConfigDelta;
use crate::backend::Connector;
use crate::backend::CreateSpec;
use crate::backend::Endpoint;
use crate::backend::Inventory;
use crate::backend::InventoryPath;
use crate::backend::ObjectKind;
use crate::backend::ObjectRef;
use crate::backend::PlacementAction;
use crate::backend::PlacementRequest;
use crate::backend::PlacementResponse;
use crate::backend::PlacementTarget;
use crate::backend::RecommendationReason;
use crate::backend::TaskState;
use crate::backend::VmConfig;
use crate::backend::VmProperties;
use async_trait::async_trait;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;
use vmop_common::api::CreateResult;
use vmop_common::api::Error;
use vmop_common::api::LookupResult;
use vmop_common::api::NetworkInterfaceStatus;
use vmop_common::api::PowerState;
use vmop_common::api::ResourceType;
use vmop_common::api::UpdateResult;

/// Backend calls that faults can be injected into
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum SimCall {
    Connect,
    Locate,
    FindVm,
    VmProperties,
    CreateVm,
    ReconfigureVm,
    PowerOn,
    PowerOff,
    DestroyVm,
    PlaceVm,
    TaskState,
    Logout,
}

/// How many times each kind of call reached the backend
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SimCounters {
    pub connects: usize,
    pub logouts: usize,
    pub creates: usize,
    pub reconfigures: usize,
    pub power_ons: usize,
    pub power_offs: usize,
    pub destroys: usize,
    pub placements: usize,
    pub task_polls: usize,
}

struct SimVm {
    name: String,
    spec: Option<CreateSpec>,
    props: VmProperties,
}

struct SimTask {
    polls_left: usize,
    outcome: TaskState,
}

struct SimState {
    inventory: Inventory,
    child_pools: BTreeSet<String>,
    child_folders: BTreeSet<String>,
    vms: BTreeMap<ObjectRef, SimVm>,
    tasks: BTreeMap<ObjectRef, SimTask>,
    next_id: u64,

    task_polls: usize,
    connect_delay: Duration,
    faults: BTreeMap<SimCall, Error>,
    task_failures: BTreeMap<SimCall, String>,
    placement: Option<PlacementResponse>,

    placement_requests: Vec<PlacementRequest>,
    reconfigures: Vec<(ObjectRef, ConfigDelta)>,
    counters: SimCounters,
}

impl SimState {
    fn next_ref(&mut self, kind: ObjectKind, prefix: &str) -> ObjectRef {
        self.next_id += 1;
        ObjectRef::new(kind, format!("{}-{}", prefix, self.next_id))
    }

    fn check_fault(&mut self, call: SimCall) -> Result<(), Error> {
        match self.faults.remove(&call) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Issue a task for a mutation of kind `call`, along with whether the
    /// mutation should be applied (it is not if the task was rigged to fail).
    fn start_task(
        &mut self,
        call: SimCall,
        result: Option<ObjectRef>,
    ) -> (ObjectRef, bool) {
        let task = self.next_ref(ObjectKind::Task, "task");
        let (outcome, proceed) = match self.task_failures.remove(&call) {
            Some(message) => (TaskState::Error { message }, false),
            None => (TaskState::Success { result }, true),
        };
        self.tasks.insert(
            task.clone(),
            SimTask { polls_left: self.task_polls, outcome },
        );
        (task, proceed)
    }

    fn fail_task(&mut self, message: String) -> ObjectRef {
        let task = self.next_ref(ObjectKind::Task, "task");
        self.tasks.insert(
            task.clone(),
            SimTask {
                polls_left: self.task_polls,
                outcome: TaskState::Error { message },
            },
        );
        task
    }

    fn vm_mut(&mut self, vm: &ObjectRef) -> LookupResult<&mut SimVm> {
        self.vms.get_mut(vm).ok_or_else(|| {
            Error::not_found_by_name(
                ResourceType::BackendVirtualMachine,
                &vm.value,
            )
        })
    }
}

/// Simulated backend: acts as the [`Connector`] handing out clients, and
/// exposes knobs and counters for tests
///
/// Clones share state.
#[derive(Clone)]
pub struct SimBackend {
    log: Logger,
    inner: Arc<Mutex<SimState>>,
}

impl SimBackend {
    pub fn new(log: &Logger) -> SimBackend {
        let inventory = Inventory {
            cluster: ObjectRef::new(
                ObjectKind::ClusterComputeResource,
                "domain-c8",
            ),
            resource_pool: ObjectRef::new(
                ObjectKind::ResourcePool,
                "resgroup-9",
            ),
            vm_folder: ObjectRef::new(ObjectKind::Folder, "group-v4"),
        };
        let state = SimState {
            inventory,
            child_pools: BTreeSet::new(),
            child_folders: BTreeSet::new(),
            vms: BTreeMap::new(),
            tasks: BTreeMap::new(),
            next_id: 100,
            task_polls: 0,
            connect_delay: Duration::ZERO,
            faults: BTreeMap::new(),
            task_failures: BTreeMap::new(),
            placement: None,
            placement_requests: Vec::new(),
            reconfigures: Vec::new(),
            counters: SimCounters::default(),
        };
        SimBackend {
            log: log.new(o!("component" => "SimBackend")),
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Returns a client for `tenant` without going through [`Connector`]
    pub fn client(&self, tenant: &str) -> Arc<dyn BackendClient> {
        Arc::new(SimClient {
            log: self.log.new(o!("tenant" => tenant.to_owned())),
            backend: self.clone(),
        })
    }

    pub fn inventory(&self) -> Inventory {
        self.inner.lock().unwrap().inventory.clone()
    }

    pub fn counters(&self) -> SimCounters {
        self.inner.lock().unwrap().counters
    }

    /// Make every subsequently issued task report "running" `polls` times
    /// before finishing.
    pub fn set_task_polls(&self, polls: usize) {
        self.inner.lock().unwrap().task_polls = polls;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().connect_delay = delay;
    }

    /// Fail the next `call` with `error`.
    pub fn inject_fault(&self, call: SimCall, error: Error) {
        self.inner.lock().unwrap().faults.insert(call, error);
    }

    /// Make the task issued by the next `call` fail with `message`.
    pub fn fail_next_task(&self, call: SimCall, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .task_failures
            .insert(call, message.to_owned());
    }

    /// Answer every placement request with `response` instead of the default
    /// single recommendation.
    pub fn set_placement(&self, response: PlacementResponse) {
        self.inner.lock().unwrap().placement = Some(response);
    }

    pub fn add_child_pool(&self, name: &str) {
        self.inner.lock().unwrap().child_pools.insert(name.to_owned());
    }

    pub fn add_child_folder(&self, name: &str) {
        self.inner.lock().unwrap().child_folders.insert(name.to_owned());
    }

    pub fn placement_requests(&self) -> Vec<PlacementRequest> {
        self.inner.lock().unwrap().placement_requests.clone()
    }

    /// Every reconfigure applied so far, in order
    pub fn reconfigures(&self) -> Vec<(ObjectRef, ConfigDelta)> {
        self.inner.lock().unwrap().reconfigures.clone()
    }

    /// Returns the machine named `name` and its current properties
    pub fn vm(&self, name: &str) -> Option<(ObjectRef, VmProperties)> {
        let state = self.inner.lock().unwrap();
        state
            .vms
            .iter()
            .find(|(_, vm)| vm.name == name)
            .map(|(vm_ref, vm)| (vm_ref.clone(), vm.props.clone()))
    }

    /// Returns the request the machine named `name` was created with
    pub fn create_spec_of(&self, name: &str) -> Option<CreateSpec> {
        let state = self.inner.lock().unwrap();
        state.vms.values().find(|vm| vm.name == name)?.spec.clone()
    }

    /// Add a machine that exists on the backend independently of the
    /// controller.
    pub fn insert_vm(&self, name: &str, props: VmProperties) -> ObjectRef {
        let mut state = self.inner.lock().unwrap();
        let vm_ref = state.next_ref(ObjectKind::VirtualMachine, "vm");
        state.vms.insert(
            vm_ref.clone(),
            SimVm { name: name.to_owned(), spec: None, props },
        );
        vm_ref
    }

    /// Change a machine's configuration behind the controller's back.
    pub fn set_vm_config(&self, name: &str, config: VmConfig) {
        let mut state = self.inner.lock().unwrap();
        if let Some(vm) = state.vms.values_mut().find(|vm| vm.name == name) {
            vm.props.config = config;
        }
    }

    /// Change a machine's power state behind the controller's back.
    pub fn set_power_state(&self, name: &str, power_state: PowerState) {
        let mut state = self.inner.lock().unwrap();
        if let Some(vm) = state.vms.values_mut().find(|vm| vm.name == name) {
            set_power(&mut vm.props, power_state);
        }
    }
}

fn set_power(props: &mut VmProperties, power_state: PowerState) {
    props.power_state = power_state;
    let on = power_state == PowerState::PoweredOn;
    props.guest_ip = on.then(|| String::from("10.0.0.10"));
    for nic in &mut props.nics {
        nic.connected = on;
        nic.ip_addresses = props.guest_ip.iter().cloned().collect();
    }
}

#[async_trait]
impl Connector for SimBackend {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        tenant: &str,
    ) -> Result<Arc<dyn BackendClient>, Error> {
        let delay = self.inner.lock().unwrap().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.inner.lock().unwrap();
            state.check_fault(SimCall::Connect)?;
            state.counters.connects += 1;
        }
        info!(self.log, "connected";
            "endpoint" => %endpoint,
            "tenant" => tenant,
        );
        Ok(self.client(tenant))
    }
}

struct SimClient {
    log: Logger,
    backend: SimBackend,
}

impl SimClient {
    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.backend.inner.lock().unwrap()
    }
}

#[async_trait]
impl BackendClient for SimClient {
    async fn locate(&self, path: &InventoryPath) -> LookupResult<Inventory> {
        let mut state = self.state();
        state.check_fault(SimCall::Locate)?;
        debug!(self.log, "locate"; "cluster" => &path.cluster);
        Ok(state.inventory.clone())
    }

    async fn find_child_pool(
        &self,
        parent: &ObjectRef,
        name: &str,
    ) -> LookupResult<ObjectRef> {
        let state = self.state();
        if *parent == state.inventory.resource_pool
            && state.child_pools.contains(name)
        {
            Ok(ObjectRef::new(
                ObjectKind::ResourcePool,
                format!("resgroup-{}", name),
            ))
        } else {
            Err(Error::not_found_by_name(
                ResourceType::BackendResourcePool,
                name,
            ))
        }
    }

    async fn find_child_folder(
        &self,
        parent: &ObjectRef,
        name: &str,
    ) -> LookupResult<ObjectRef> {
        let state = self.state();
        if *parent == state.inventory.vm_folder
            && state.child_folders.contains(name)
        {
            Ok(ObjectRef::new(ObjectKind::Folder, format!("group-{}", name)))
        } else {
            Err(Error::not_found_by_name(ResourceType::BackendFolder, name))
        }
    }

    async fn find_vm_by_name(
        &self,
        _folder: &ObjectRef,
        name: &str,
    ) -> LookupResult<ObjectRef> {
        let mut state = self.state();
        state.check_fault(SimCall::FindVm)?;
        state
            .vms
            .iter()
            .find(|(_, vm)| vm.name == name)
            .map(|(vm_ref, _)| vm_ref.clone())
            .ok_or_else(|| {
                Error::not_found_by_name(
                    ResourceType::BackendVirtualMachine,
                    name,
                )
            })
    }

    async fn vm_properties(
        &self,
        vm: &ObjectRef,
    ) -> LookupResult<VmProperties> {
        let mut state = self.state();
        state.check_fault(SimCall::VmProperties)?;
        Ok(state.vm_mut(vm)?.props.clone())
    }

    async fn create_vm(&self, spec: &CreateSpec) -> CreateResult<ObjectRef> {
        let mut state = self.state();
        state.check_fault(SimCall::CreateVm)?;
        state.counters.creates += 1;
        if state.vms.values().any(|vm| vm.name == spec.name) {
            return Ok(state.fail_task(format!(
                "The name '{}' already exists.",
                spec.name
            )));
        }

        let vm_ref = state.next_ref(ObjectKind::VirtualMachine, "vm");
        let (task, proceed) =
            state.start_task(SimCall::CreateVm, Some(vm_ref.clone()));
        if !proceed {
            return Ok(task);
        }

        let nics = spec
            .nics
            .iter()
            .enumerate()
            .map(|(i, _)| NetworkInterfaceStatus {
                connected: false,
                mac_address: format!("00:50:56:00:00:{:02x}", i + 1),
                ip_addresses: Vec::new(),
            })
            .collect();
        let props = VmProperties {
            power_state: PowerState::PoweredOff,
            host: spec.host.as_ref().map(|h| h.value.clone()),
            guest_ip: None,
            bios_uuid: Some(Uuid::new_v4().to_string()),
            instance_uuid: Some(Uuid::new_v4().to_string()),
            config: spec.config.clone(),
            nics,
        };
        info!(self.log, "created vm";
            "name" => &spec.name,
            "vm_ref" => %vm_ref,
            "pool" => %spec.pool,
        );
        state.vms.insert(
            vm_ref,
            SimVm {
                name: spec.name.clone(),
                spec: Some(spec.clone()),
                props,
            },
        );
        Ok(task)
    }

    async fn reconfigure_vm(
        &self,
        vm: &ObjectRef,
        delta: &ConfigDelta,
    ) -> UpdateResult<ObjectRef> {
        let mut state = self.state();
        state.check_fault(SimCall::ReconfigureVm)?;
        state.vm_mut(vm)?;
        state.counters.reconfigures += 1;
        let (task, proceed) = state.start_task(SimCall::ReconfigureVm, None);
        if proceed {
            delta.apply_to(&mut state.vm_mut(vm)?.props.config);
            state.reconfigures.push((vm.clone(), delta.clone()));
        }
        Ok(task)
    }

    async fn power_on(&self, vm: &ObjectRef) -> UpdateResult<ObjectRef> {
        let mut state = self.state();
        state.check_fault(SimCall::PowerOn)?;
        state.vm_mut(vm)?;
        state.counters.power_ons += 1;
        let (task, proceed) = state.start_task(SimCall::PowerOn, None);
        if proceed {
            set_power(&mut state.vm_mut(vm)?.props, PowerState::PoweredOn);
        }
        Ok(task)
    }

    async fn power_off(&self, vm: &ObjectRef) -> UpdateResult<ObjectRef> {
        let mut state = self.state();
        state.check_fault(SimCall::PowerOff)?;
        state.vm_mut(vm)?;
        state.counters.power_offs += 1;
        let (task, proceed) = state.start_task(SimCall::PowerOff, None);
        if proceed {
            set_power(&mut state.vm_mut(vm)?.props, PowerState::PoweredOff);
        }
        Ok(task)
    }

    async fn destroy_vm(&self, vm: &ObjectRef) -> Result<ObjectRef, Error> {
        let mut state = self.state();
        state.check_fault(SimCall::DestroyVm)?;
        let power_state = state.vm_mut(vm)?.props.power_state;
        state.counters.destroys += 1;
        if power_state != PowerState::PoweredOff {
            return Ok(state.fail_task(format!(
                "The attempted operation cannot be performed in the current \
                 state ({})",
                power_state
            )));
        }
        let (task, proceed) = state.start_task(SimCall::DestroyVm, None);
        if proceed {
            state.vms.remove(vm);
            info!(self.log, "destroyed vm"; "vm_ref" => %vm);
        }
        Ok(task)
    }

    async fn task_state(&self, task: &ObjectRef) -> LookupResult<TaskState> {
        let mut state = self.state();
        state.check_fault(SimCall::TaskState)?;
        state.counters.task_polls += 1;
        let sim_task = state.tasks.get_mut(task).ok_or_else(|| {
            Error::not_found_by_name(ResourceType::BackendTask, &task.value)
        })?;
        if sim_task.polls_left > 0 {
            sim_task.polls_left -= 1;
            return Ok(TaskState::Running);
        }
        Ok(sim_task.outcome.clone())
    }

    async fn place_vm(
        &self,
        request: &PlacementRequest,
    ) -> Result<PlacementResponse, Error> {
        let mut state = self.state();
        state.check_fault(SimCall::PlaceVm)?;
        state.counters.placements += 1;
        state.placement_requests.push(request.clone());
        if let Some(response) = &state.placement {
            return Ok(response.clone());
        }

        let (reason, pool) = match &request.target {
            PlacementTarget::Cluster(_) => (
                RecommendationReason::XvmotionPlacement,
                state.inventory.resource_pool.clone(),
            ),
            PlacementTarget::ResourcePools(pools) => (
                RecommendationReason::XClusterPlacement,
                pools
                    .first()
                    .cloned()
                    .unwrap_or_else(|| state.inventory.resource_pool.clone()),
            ),
        };
        Ok(PlacementResponse {
            recommendations: vec![BackendRecommendation {
                reason,
                actions: vec![PlacementAction::Placement {
                    pool: Some(pool),
                    host: Some(ObjectRef::new(
                        ObjectKind::HostSystem,
                        "host-1",
                    )),
                }],
            }],
            faults: Vec::new(),
        })
    }

    async fn logout(&self) -> Result<(), Error> {
        let mut state = self.state();
        state.check_fault(SimCall::Logout)?;
        state.counters.logouts += 1;
        Ok(())
    }
}
