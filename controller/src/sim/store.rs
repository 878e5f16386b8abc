// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated control-plane store

use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;
use vmop_common::api::ContentLibraryProvider;
use vmop_common::api::ContentSourceBinding;
use vmop_common::api::CreateResult;
use vmop_common::api::DeleteResult;
use vmop_common::api::Error;
use vmop_common::api::ListResult;
use vmop_common::api::LookupResult;
use vmop_common::api::LookupType;
use vmop_common::api::MachineKey;
use vmop_common::api::MetadataSource;
use vmop_common::api::MetadataSourceKind;
use vmop_common::api::ResourceType;
use vmop_common::api::UpdateResult;
use vmop_common::api::VirtualMachine;
use vmop_common::api::VirtualMachineClass;
use vmop_common::api::VirtualMachineClassBinding;
use vmop_common::api::VirtualMachineImage;
use vmop_common::api::VirtualMachineSetResourcePolicy;
use vmop_common::api::VirtualMachineStatus;
use vmop_common::api::VolumeAttachment;

/// How many writes of each kind reached the store
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SimStoreCounters {
    pub finalizer_writes: usize,
    pub status_writes: usize,
    pub attachment_creates: usize,
    pub attachment_deletes: usize,
}

type NamespacedName = (String, String);

fn nsname(namespace: &str, name: &str) -> NamespacedName {
    (namespace.to_owned(), name.to_owned())
}

fn not_found_in(
    type_name: ResourceType,
    namespace: &str,
    name: &str,
) -> Error {
    LookupType::ByCompositeId(format!("{}/{}", namespace, name))
        .into_not_found(type_name)
}

fn vm_not_found(key: &MachineKey) -> Error {
    not_found_in(ResourceType::VirtualMachine, &key.namespace, &key.name)
}

#[derive(Default)]
struct StoreState {
    vms: BTreeMap<MachineKey, VirtualMachine>,
    classes: BTreeMap<String, VirtualMachineClass>,
    class_bindings: BTreeMap<NamespacedName, VirtualMachineClassBinding>,
    images: BTreeMap<String, VirtualMachineImage>,
    providers: BTreeMap<String, ContentLibraryProvider>,
    content_bindings: BTreeMap<NamespacedName, ContentSourceBinding>,
    metadata: BTreeMap<(String, MetadataSourceKind, String), MetadataSource>,
    policies: BTreeMap<NamespacedName, VirtualMachineSetResourcePolicy>,
    attachments: BTreeMap<NamespacedName, VolumeAttachment>,
    attachment_create_faults: BTreeMap<String, Error>,
    counters: SimStoreCounters,
}

/// In-memory [`Store`] with helpers for arranging test scenarios
#[derive(Default)]
pub struct SimStore {
    inner: Mutex<StoreState>,
}

impl SimStore {
    pub fn new() -> SimStore {
        SimStore::default()
    }

    pub fn counters(&self) -> SimStoreCounters {
        self.inner.lock().unwrap().counters
    }

    pub fn insert_vm(&self, vm: VirtualMachine) {
        self.inner.lock().unwrap().vms.insert(vm.key(), vm);
    }

    pub fn vm(&self, key: &MachineKey) -> Option<VirtualMachine> {
        self.inner.lock().unwrap().vms.get(key).cloned()
    }

    /// Mark a machine for deletion, as the store does when a delete is
    /// requested for an object that still has finalizers.
    pub fn mark_deleting(&self, key: &MachineKey) {
        let mut state = self.inner.lock().unwrap();
        if let Some(vm) = state.vms.get_mut(key) {
            if vm.metadata.finalizers.is_empty() {
                state.vms.remove(key);
            } else {
                vm.metadata.deletion_timestamp.get_or_insert_with(Utc::now);
            }
        }
    }

    pub fn insert_class(&self, class: VirtualMachineClass) {
        self.inner.lock().unwrap().classes.insert(class.name.clone(), class);
    }

    pub fn insert_class_binding(&self, binding: VirtualMachineClassBinding) {
        let key = nsname(&binding.namespace, &binding.name);
        self.inner.lock().unwrap().class_bindings.insert(key, binding);
    }

    pub fn insert_image(&self, image: VirtualMachineImage) {
        self.inner.lock().unwrap().images.insert(image.name.clone(), image);
    }

    pub fn insert_provider(&self, provider: ContentLibraryProvider) {
        self.inner
            .lock()
            .unwrap()
            .providers
            .insert(provider.name.clone(), provider);
    }

    pub fn insert_content_source_binding(&self, binding: ContentSourceBinding) {
        let key = nsname(&binding.namespace, &binding.name);
        self.inner.lock().unwrap().content_bindings.insert(key, binding);
    }

    /// Remove every binding granting `namespace` access to `content_source`
    pub fn remove_content_source_binding(
        &self,
        namespace: &str,
        content_source: &str,
    ) {
        self.inner.lock().unwrap().content_bindings.retain(|_, b| {
            !(b.namespace == namespace
                && b.content_source_ref == content_source)
        });
    }

    pub fn insert_metadata_source(&self, source: MetadataSource) {
        let key =
            (source.namespace.clone(), source.kind, source.name.clone());
        self.inner.lock().unwrap().metadata.insert(key, source);
    }

    pub fn insert_resource_policy(
        &self,
        policy: VirtualMachineSetResourcePolicy,
    ) {
        let key = nsname(&policy.namespace, &policy.name);
        self.inner.lock().unwrap().policies.insert(key, policy);
    }

    pub fn volume_attachments_of(
        &self,
        namespace: &str,
        vm_name: &str,
    ) -> Vec<VolumeAttachment> {
        self.inner
            .lock()
            .unwrap()
            .attachments
            .values()
            .filter(|a| a.namespace == namespace && a.vm_name == vm_name)
            .cloned()
            .collect()
    }

    /// Report attachment `name` as attached, as the storage layer would.
    pub fn mark_attached(&self, namespace: &str, name: &str, disk_uuid: &str) {
        let mut state = self.inner.lock().unwrap();
        if let Some(a) = state.attachments.get_mut(&nsname(namespace, name)) {
            a.status.attached = true;
            a.status.disk_uuid = Some(disk_uuid.to_owned());
            a.status.error = None;
        }
    }

    /// Report attachment `name` as failed, as the storage layer would.
    pub fn mark_attachment_failed(
        &self,
        namespace: &str,
        name: &str,
        message: &str,
    ) {
        let mut state = self.inner.lock().unwrap();
        if let Some(a) = state.attachments.get_mut(&nsname(namespace, name)) {
            a.status.attached = false;
            a.status.error = Some(message.to_owned());
        }
    }

    /// Fail the next attempt to create an attachment for `volume_name`.
    pub fn fail_attachment_create(&self, volume_name: &str, error: Error) {
        self.inner
            .lock()
            .unwrap()
            .attachment_create_faults
            .insert(volume_name.to_owned(), error);
    }
}

#[async_trait]
impl Store for SimStore {
    async fn virtual_machine(
        &self,
        key: &MachineKey,
    ) -> LookupResult<VirtualMachine> {
        self.vm(key).ok_or_else(|| vm_not_found(key))
    }

    async fn update_finalizers(
        &self,
        key: &MachineKey,
        finalizers: &[String],
    ) -> UpdateResult<VirtualMachine> {
        let mut state = self.inner.lock().unwrap();
        let vm = state.vms.get_mut(key).ok_or_else(|| vm_not_found(key))?;
        vm.metadata.finalizers = finalizers.to_vec();
        let updated = vm.clone();
        if updated.is_deleting() && finalizers.is_empty() {
            state.vms.remove(key);
        }
        state.counters.finalizer_writes += 1;
        Ok(updated)
    }

    async fn update_status(
        &self,
        key: &MachineKey,
        status: &VirtualMachineStatus,
    ) -> UpdateResult<()> {
        let mut state = self.inner.lock().unwrap();
        let vm = state.vms.get_mut(key).ok_or_else(|| vm_not_found(key))?;
        vm.status = status.clone();
        state.counters.status_writes += 1;
        Ok(())
    }

    async fn virtual_machine_class(
        &self,
        name: &str,
    ) -> LookupResult<VirtualMachineClass> {
        self.inner.lock().unwrap().classes.get(name).cloned().ok_or_else(|| {
            Error::not_found_by_name(ResourceType::VirtualMachineClass, name)
        })
    }

    async fn class_binding(
        &self,
        namespace: &str,
        class_name: &str,
    ) -> LookupResult<VirtualMachineClassBinding> {
        self.inner
            .lock()
            .unwrap()
            .class_bindings
            .values()
            .find(|b| b.namespace == namespace && b.class_ref == class_name)
            .cloned()
            .ok_or_else(|| {
                not_found_in(
                    ResourceType::VirtualMachineClassBinding,
                    namespace,
                    class_name,
                )
            })
    }

    async fn virtual_machine_image(
        &self,
        name: &str,
    ) -> LookupResult<VirtualMachineImage> {
        self.inner.lock().unwrap().images.get(name).cloned().ok_or_else(|| {
            Error::not_found_by_name(ResourceType::VirtualMachineImage, name)
        })
    }

    async fn content_library_provider(
        &self,
        name: &str,
    ) -> LookupResult<ContentLibraryProvider> {
        self.inner.lock().unwrap().providers.get(name).cloned().ok_or_else(
            || {
                Error::not_found_by_name(
                    ResourceType::ContentLibraryProvider,
                    name,
                )
            },
        )
    }

    async fn content_source_binding(
        &self,
        namespace: &str,
        content_source: &str,
    ) -> LookupResult<ContentSourceBinding> {
        self.inner
            .lock()
            .unwrap()
            .content_bindings
            .values()
            .find(|b| {
                b.namespace == namespace
                    && b.content_source_ref == content_source
            })
            .cloned()
            .ok_or_else(|| {
                not_found_in(
                    ResourceType::ContentSourceBinding,
                    namespace,
                    content_source,
                )
            })
    }

    async fn metadata_source(
        &self,
        namespace: &str,
        kind: MetadataSourceKind,
        name: &str,
    ) -> LookupResult<MetadataSource> {
        let key = (namespace.to_owned(), kind, name.to_owned());
        self.inner.lock().unwrap().metadata.get(&key).cloned().ok_or_else(
            || {
                let type_name = match kind {
                    MetadataSourceKind::ConfigMap => ResourceType::ConfigMap,
                    MetadataSourceKind::Secret => ResourceType::Secret,
                };
                not_found_in(type_name, namespace, name)
            },
        )
    }

    async fn resource_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> LookupResult<VirtualMachineSetResourcePolicy> {
        self.inner
            .lock()
            .unwrap()
            .policies
            .get(&nsname(namespace, name))
            .cloned()
            .ok_or_else(|| {
                not_found_in(ResourceType::ResourcePolicy, namespace, name)
            })
    }

    async fn volume_attachments(
        &self,
        namespace: &str,
        vm_name: &str,
    ) -> ListResult<VolumeAttachment> {
        Ok(self.volume_attachments_of(namespace, vm_name))
    }

    async fn volume_attachment(
        &self,
        namespace: &str,
        name: &str,
    ) -> LookupResult<VolumeAttachment> {
        self.inner
            .lock()
            .unwrap()
            .attachments
            .get(&nsname(namespace, name))
            .cloned()
            .ok_or_else(|| {
                not_found_in(ResourceType::VolumeAttachment, namespace, name)
            })
    }

    async fn create_volume_attachment(
        &self,
        attachment: &VolumeAttachment,
    ) -> CreateResult<VolumeAttachment> {
        let mut state = self.inner.lock().unwrap();
        if let Some(error) =
            state.attachment_create_faults.remove(&attachment.volume_name)
        {
            return Err(error);
        }
        let key = nsname(&attachment.namespace, &attachment.name);
        if state.attachments.contains_key(&key) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::VolumeAttachment,
                object_name: attachment.name.clone(),
            });
        }
        state.attachments.insert(key, attachment.clone());
        state.counters.attachment_creates += 1;
        Ok(attachment.clone())
    }

    async fn delete_volume_attachment(
        &self,
        namespace: &str,
        name: &str,
    ) -> DeleteResult {
        let mut state = self.inner.lock().unwrap();
        state.attachments.remove(&nsname(namespace, name)).ok_or_else(|| {
            not_found_in(ResourceType::VolumeAttachment, namespace, name)
        })?;
        state.counters.attachment_deletes += 1;
        Ok(())
    }
}
