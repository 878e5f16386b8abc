// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the control-plane store

use async_trait::async_trait;
use vmop_common::api::ContentLibraryProvider;
use vmop_common::api::ContentSourceBinding;
use vmop_common::api::CreateResult;
use vmop_common::api::DeleteResult;
use vmop_common::api::ListResult;
use vmop_common::api::LookupResult;
use vmop_common::api::MachineKey;
use vmop_common::api::MetadataSource;
use vmop_common::api::MetadataSourceKind;
use vmop_common::api::UpdateResult;
use vmop_common::api::VirtualMachine;
use vmop_common::api::VirtualMachineClass;
use vmop_common::api::VirtualMachineClassBinding;
use vmop_common::api::VirtualMachineImage;
use vmop_common::api::VirtualMachineSetResourcePolicy;
use vmop_common::api::VirtualMachineStatus;
use vmop_common::api::VolumeAttachment;

/// Everything the controller reads from or writes to the control-plane store
///
/// The controller only ever writes a machine's finalizers and status, plus
/// the volume attachment objects it owns.
#[async_trait]
pub trait Store: Send + Sync {
    async fn virtual_machine(
        &self,
        key: &MachineKey,
    ) -> LookupResult<VirtualMachine>;

    /// Replace the finalizer list of a machine, returning the updated record
    ///
    /// Once a machine marked for deletion has no finalizers left, the store
    /// removes it.
    async fn update_finalizers(
        &self,
        key: &MachineKey,
        finalizers: &[String],
    ) -> UpdateResult<VirtualMachine>;

    /// Overwrite the status of a machine
    async fn update_status(
        &self,
        key: &MachineKey,
        status: &VirtualMachineStatus,
    ) -> UpdateResult<()>;

    async fn virtual_machine_class(
        &self,
        name: &str,
    ) -> LookupResult<VirtualMachineClass>;

    /// Find the binding granting `namespace` access to class `class_name`
    async fn class_binding(
        &self,
        namespace: &str,
        class_name: &str,
    ) -> LookupResult<VirtualMachineClassBinding>;

    async fn virtual_machine_image(
        &self,
        name: &str,
    ) -> LookupResult<VirtualMachineImage>;

    async fn content_library_provider(
        &self,
        name: &str,
    ) -> LookupResult<ContentLibraryProvider>;

    /// Find the binding granting `namespace` access to `content_source`
    async fn content_source_binding(
        &self,
        namespace: &str,
        content_source: &str,
    ) -> LookupResult<ContentSourceBinding>;

    async fn metadata_source(
        &self,
        namespace: &str,
        kind: MetadataSourceKind,
        name: &str,
    ) -> LookupResult<MetadataSource>;

    async fn resource_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> LookupResult<VirtualMachineSetResourcePolicy>;

    /// List the volume attachment objects belonging to one machine
    async fn volume_attachments(
        &self,
        namespace: &str,
        vm_name: &str,
    ) -> ListResult<VolumeAttachment>;

    async fn volume_attachment(
        &self,
        namespace: &str,
        name: &str,
    ) -> LookupResult<VolumeAttachment>;

    async fn create_volume_attachment(
        &self,
        attachment: &VolumeAttachment,
    ) -> CreateResult<VolumeAttachment>;

    async fn delete_volume_attachment(
        &self,
        namespace: &str,
        name: &str,
    ) -> DeleteResult;
}
