// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-tenant backend sessions

use crate::backend::BackendClient;
use crate::backend::ConfigDelta;
use crate::backend::Connector;
use crate::backend::CreateSpec;
use crate::backend::Endpoint;
use crate::backend::Inventory;
use crate::backend::ObjectKind;
use crate::backend::ObjectRef;
use crate::backend::PlacementRequest;
use crate::backend::PlacementResponse;
use crate::backend::VmProperties;
use crate::config::BackendConfig;
use crate::task::wait_for_task;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;
use vmop_common::api::CreateResult;
use vmop_common::api::Error;
use vmop_common::api::LookupResult;
use vmop_common::api::UpdateResult;

/// A live authenticated connection to the backend, scoped to one tenant
///
/// Sessions are owned by the [`SessionCache`].  A reconciliation pass borrows
/// one for its duration and must not hold on to it afterwards.
pub struct Session {
    id: Uuid,
    log: Logger,
    tenant: String,
    endpoint: Endpoint,
    client: Arc<dyn BackendClient>,
    inventory: Inventory,
    call_timeout: Duration,
    task_deadline: Duration,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Run one backend call, bounded by the per-call timeout.
    async fn call<T, F>(&self, what: &'static str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::unavail(&format!(
                "{} timed out after {:?}",
                what, self.call_timeout
            ))),
        }
    }

    /// Block until `task` completes, returning what it produced.
    async fn wait(&self, task: &ObjectRef) -> Result<Option<ObjectRef>, Error> {
        let result = wait_for_task(
            &self.log,
            self.client.as_ref(),
            task,
            self.task_deadline,
            self.call_timeout,
        )
        .await?;
        Ok(result)
    }

    pub async fn find_child_pool(&self, name: &str) -> LookupResult<ObjectRef> {
        self.call(
            "find resource pool",
            self.client.find_child_pool(&self.inventory.resource_pool, name),
        )
        .await
    }

    pub async fn find_child_folder(
        &self,
        name: &str,
    ) -> LookupResult<ObjectRef> {
        self.call(
            "find folder",
            self.client.find_child_folder(&self.inventory.vm_folder, name),
        )
        .await
    }

    pub async fn find_vm(&self, name: &str) -> LookupResult<ObjectRef> {
        self.call(
            "find vm",
            self.client.find_vm_by_name(&self.inventory.vm_folder, name),
        )
        .await
    }

    pub async fn vm_properties(
        &self,
        vm: &ObjectRef,
    ) -> LookupResult<VmProperties> {
        self.call("read vm properties", self.client.vm_properties(vm)).await
    }

    pub async fn place_vm(
        &self,
        request: &PlacementRequest,
    ) -> Result<PlacementResponse, Error> {
        self.call("place vm", self.client.place_vm(request)).await
    }

    /// Create a machine and wait for it to exist.
    pub async fn create_vm(
        &self,
        spec: &CreateSpec,
    ) -> CreateResult<ObjectRef> {
        let context = format!("create VM {:?} task failed", spec.name);
        let task = self.call("create vm", self.client.create_vm(spec)).await?;
        let created = self
            .wait(&task)
            .await
            .map_err(|e| e.internal_context(context.clone()))?;
        match created {
            Some(vm) if vm.kind == ObjectKind::VirtualMachine => Ok(vm),
            _ => Err(Error::internal_error(&format!(
                "{}: task {} did not produce a vm",
                context, task
            ))),
        }
    }

    pub async fn reconfigure_vm(
        &self,
        vm: &ObjectRef,
        delta: &ConfigDelta,
    ) -> UpdateResult<()> {
        let task = self
            .call("reconfigure vm", self.client.reconfigure_vm(vm, delta))
            .await?;
        self.wait(&task).await?;
        Ok(())
    }

    pub async fn power_on(&self, vm: &ObjectRef) -> UpdateResult<()> {
        let task = self.call("power on vm", self.client.power_on(vm)).await?;
        self.wait(&task).await?;
        Ok(())
    }

    pub async fn power_off(&self, vm: &ObjectRef) -> UpdateResult<()> {
        let task = self.call("power off vm", self.client.power_off(vm)).await?;
        self.wait(&task).await?;
        Ok(())
    }

    pub async fn destroy_vm(&self, vm: &ObjectRef) -> Result<(), Error> {
        let task = self.call("destroy vm", self.client.destroy_vm(vm)).await?;
        self.wait(&task).await?;
        Ok(())
    }

    async fn logout(&self) {
        debug!(self.log, "logging out");
        if let Err(e) = self.call("logout", self.client.logout()).await {
            warn!(self.log, "failed to log out of session"; "error" => %e);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Holds a tenant's session, if one has been established
///
/// Locked across session establishment so that concurrent callers for the
/// same tenant wait for one connection instead of each making their own.
type Slot = tokio::sync::Mutex<Option<Arc<Session>>>;

struct CacheState {
    endpoint: Endpoint,
    slots: BTreeMap<String, Arc<Slot>>,
}

/// Owns every live backend session, keyed by tenant
pub struct SessionCache {
    log: Logger,
    connector: Arc<dyn Connector>,
    config: BackendConfig,
    state: Mutex<CacheState>,
}

impl SessionCache {
    pub fn new(
        log: &Logger,
        connector: Arc<dyn Connector>,
        config: BackendConfig,
    ) -> SessionCache {
        let state = CacheState {
            endpoint: config.endpoint.clone(),
            slots: BTreeMap::new(),
        };
        SessionCache {
            log: log.new(o!("component" => "SessionCache")),
            connector,
            config,
            state: Mutex::new(state),
        }
    }

    /// Returns the endpoint new sessions are established against
    pub fn endpoint(&self) -> Endpoint {
        self.state.lock().unwrap().endpoint.clone()
    }

    /// Returns a live session for `tenant`, establishing one if needed
    pub async fn get(&self, tenant: &str) -> Result<Arc<Session>, Error> {
        loop {
            let (slot, endpoint) = {
                let mut state = self.state.lock().unwrap();
                let slot = state
                    .slots
                    .entry(tenant.to_owned())
                    .or_insert_with(|| Arc::new(Slot::new(None)))
                    .clone();
                (slot, state.endpoint.clone())
            };

            let mut cached = slot.lock().await;
            if let Some(session) = cached.as_ref() {
                return Ok(Arc::clone(session));
            }

            let session = Arc::new(self.establish(&endpoint, tenant).await?);

            // The slot may have been invalidated while we were connecting.
            // That session predates the invalidation, so close it and start
            // over rather than hand it out.
            if !self.is_current(tenant, &slot) {
                info!(self.log, "session invalidated while connecting";
                    "tenant" => tenant,
                    "session_id" => %session.id(),
                );
                drop(cached);
                session.logout().await;
                continue;
            }

            *cached = Some(Arc::clone(&session));
            return Ok(session);
        }
    }

    /// Drop and close the cached session for `tenant`, if any
    pub async fn invalidate(&self, tenant: &str) {
        let slot = self.state.lock().unwrap().slots.remove(tenant);
        if let Some(slot) = slot {
            info!(self.log, "invalidating session"; "tenant" => tenant);
            Self::close(slot).await;
        }
    }

    /// Drop and close every cached session
    pub async fn invalidate_all(&self) {
        let slots = std::mem::take(&mut self.state.lock().unwrap().slots);
        self.close_all(slots).await;
    }

    /// Record the current identity of the backend endpoint.
    ///
    /// Returns whether it changed; if so, every cached session was bound to
    /// the old endpoint and is closed.
    pub async fn update_endpoint(&self, endpoint: Endpoint) -> bool {
        let slots = {
            let mut state = self.state.lock().unwrap();
            if state.endpoint == endpoint {
                return false;
            }
            info!(self.log, "backend endpoint changed";
                "old" => %state.endpoint,
                "new" => %endpoint,
            );
            state.endpoint = endpoint;
            std::mem::take(&mut state.slots)
        };
        self.close_all(slots).await;
        true
    }

    /// Returns the tenants that currently have a cache entry
    pub fn tenants(&self) -> Vec<String> {
        self.state.lock().unwrap().slots.keys().cloned().collect()
    }

    fn is_current(&self, tenant: &str, slot: &Arc<Slot>) -> bool {
        self.state
            .lock()
            .unwrap()
            .slots
            .get(tenant)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    async fn establish(
        &self,
        endpoint: &Endpoint,
        tenant: &str,
    ) -> Result<Session, Error> {
        let call_timeout = self.config.call_timeout;
        let client = tokio::time::timeout(
            call_timeout,
            self.connector.connect(endpoint, tenant),
        )
        .await
        .map_err(|_| {
            Error::unavail(&format!("connecting to {} timed out", endpoint))
        })?
        .map_err(|e| {
            e.internal_context(format!("connecting to {}", endpoint))
        })?;

        let id = Uuid::new_v4();
        let log = self.log.new(o!(
            "tenant" => tenant.to_owned(),
            "session_id" => id.to_string(),
        ));

        let inventory = match tokio::time::timeout(
            call_timeout,
            client.locate(&self.config.inventory),
        )
        .await
        {
            Ok(Ok(inventory)) => inventory,
            Ok(Err(e)) => {
                let _ = client.logout().await;
                return Err(e.internal_context("locating cluster"));
            }
            Err(_) => {
                let _ = client.logout().await;
                return Err(Error::unavail("locating cluster timed out"));
            }
        };

        info!(log, "established session";
            "endpoint" => %endpoint,
            "cluster" => %inventory.cluster,
        );
        Ok(Session {
            id,
            log,
            tenant: tenant.to_owned(),
            endpoint: endpoint.clone(),
            client,
            inventory,
            call_timeout,
            task_deadline: self.config.task_deadline,
        })
    }

    async fn close(slot: Arc<Slot>) {
        // Waits out any in-flight establishment holding the slot; that caller
        // notices the slot is gone and closes its own session.
        if let Some(session) = slot.lock().await.take() {
            session.logout().await;
        }
    }

    async fn close_all(&self, slots: BTreeMap<String, Arc<Slot>>) {
        if slots.is_empty() {
            return;
        }
        info!(self.log, "invalidating all sessions"; "count" => slots.len());
        futures::future::join_all(slots.into_values().map(Self::close)).await;
    }
}
