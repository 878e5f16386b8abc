// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving volume attachment objects for a machine's declared volumes
//!
//! Attachment itself is carried out asynchronously by the storage layer.  The
//! orchestrator makes sure exactly one attachment object exists per declared
//! volume and reflects what those objects report back into the machine's
//! volume status.  A pass that fails partway through is continued by the
//! next pass; attachment objects that were already created are left in
//! place.

use crate::reconciler::Outcome;
use crate::session::Session;
use crate::store::Store;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use vmop_common::api::Error;
use vmop_common::api::VirtualMachine;
use vmop_common::api::VolumeAttachment;
use vmop_common::api::VolumeState;
use vmop_common::api::VolumeStatus;

/// Result of one [`VolumeOrchestrator::converge`] call
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeConvergence {
    /// one entry per declared volume, in declaration order
    pub statuses: Vec<VolumeStatus>,
    /// [`Outcome::Requeue`] while any volume is still pending
    pub outcome: Outcome,
    /// attachment objects created by this call
    pub created: usize,
    /// orphaned attachment objects deleted by this call
    pub deleted: usize,
}

pub struct VolumeOrchestrator {
    log: Logger,
    store: Arc<dyn Store>,
}

impl VolumeOrchestrator {
    pub fn new(log: &Logger, store: Arc<dyn Store>) -> VolumeOrchestrator {
        VolumeOrchestrator {
            log: log.new(o!("component" => "VolumeOrchestrator")),
            store,
        }
    }

    /// Bring the attachment objects for `vm` in line with its declared
    /// volumes and report where each volume stands.
    ///
    /// `node_uuid` identifies the backend machine the volumes attach to and
    /// is recorded on newly created attachment objects.
    pub async fn converge(
        &self,
        session: &Session,
        vm: &VirtualMachine,
        node_uuid: Option<&str>,
    ) -> Result<VolumeConvergence, Error> {
        let namespace = &vm.metadata.namespace;
        if session.tenant() != namespace {
            return Err(Error::internal_error(&format!(
                "session for tenant {:?} used for machine in {:?}",
                session.tenant(),
                namespace
            )));
        }
        let log = self.log.new(o!("vm" => vm.key().to_string()));

        let mut existing: BTreeMap<String, VolumeAttachment> = self
            .store
            .volume_attachments(namespace, &vm.metadata.name)
            .await?
            .into_iter()
            .map(|a| (a.volume_name.clone(), a))
            .collect();

        let declared: BTreeSet<&str> =
            vm.spec.volumes.iter().map(|v| v.name.as_str()).collect();

        let mut deleted = 0;
        let orphans: Vec<String> = existing
            .keys()
            .filter(|volume| !declared.contains(volume.as_str()))
            .cloned()
            .collect();
        for volume in orphans {
            let Some(attachment) = existing.remove(&volume) else {
                continue;
            };
            info!(log, "deleting orphaned volume attachment";
                "volume" => &volume,
                "attachment" => &attachment.name,
            );
            match self
                .store
                .delete_volume_attachment(namespace, &attachment.name)
                .await
            {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => (),
                Err(e) => return Err(e),
            }
        }

        let mut created = 0;
        let mut seen = BTreeSet::new();
        let mut statuses = Vec::with_capacity(declared.len());
        for volume in &vm.spec.volumes {
            if !seen.insert(volume.name.as_str()) {
                warn!(log, "ignoring duplicate volume";
                    "volume" => &volume.name,
                );
                continue;
            }

            let status = match existing.get(&volume.name) {
                Some(attachment) => status_of(attachment),
                None => {
                    let attachment =
                        VolumeAttachment::new(vm, volume, node_uuid);
                    match self.store.create_volume_attachment(&attachment).await
                    {
                        Ok(_) => {
                            info!(log, "created volume attachment";
                                "volume" => &volume.name,
                                "attachment" => &attachment.name,
                            );
                            created += 1;
                            VolumeStatus::pending(&volume.name)
                        }
                        Err(Error::ObjectAlreadyExists { .. }) => {
                            self.existing_status(&log, &attachment).await?
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            statuses.push(status);
        }

        let pending = statuses
            .iter()
            .filter(|s| s.state() == VolumeState::Pending)
            .count();
        let outcome =
            if pending > 0 { Outcome::Requeue } else { Outcome::Done };
        debug!(log, "volume convergence";
            "declared" => statuses.len(),
            "pending" => pending,
            "created" => created,
            "deleted" => deleted,
        );

        Ok(VolumeConvergence { statuses, outcome, created, deleted })
    }

    /// Status of a volume whose attachment object already exists under the
    /// name we tried to create.
    ///
    /// The object may have been created by a pass we raced with, or it may
    /// belong to another machine whose name and volume name concatenate to
    /// the same object name.  The latter can never attach for us, so it is
    /// reported as a failure rather than left pending.
    async fn existing_status(
        &self,
        log: &Logger,
        wanted: &VolumeAttachment,
    ) -> Result<VolumeStatus, Error> {
        let found = match self
            .store
            .volume_attachment(&wanted.namespace, &wanted.name)
            .await
        {
            Ok(found) => found,
            // Deleted since; the next pass creates it again.
            Err(e) if e.is_not_found() => {
                return Ok(VolumeStatus::pending(&wanted.volume_name));
            }
            Err(e) => return Err(e),
        };

        if found.vm_name == wanted.vm_name
            && found.volume_name == wanted.volume_name
        {
            return Ok(status_of(&found));
        }

        warn!(log, "volume attachment name is taken";
            "volume" => &wanted.volume_name,
            "attachment" => &wanted.name,
            "owner" => &found.vm_name,
        );
        Ok(VolumeStatus {
            name: wanted.volume_name.clone(),
            attached: false,
            disk_uuid: None,
            error: Some(format!(
                "attachment {:?} belongs to machine {:?}",
                wanted.name, found.vm_name
            )),
        })
    }

    /// Delete every attachment object belonging to `vm`
    pub async fn remove_all(
        &self,
        vm: &VirtualMachine,
    ) -> Result<usize, Error> {
        let namespace = &vm.metadata.namespace;
        let mut deleted = 0;
        for attachment in
            self.store.volume_attachments(namespace, &vm.metadata.name).await?
        {
            match self
                .store
                .delete_volume_attachment(namespace, &attachment.name)
                .await
            {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => (),
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

fn status_of(attachment: &VolumeAttachment) -> VolumeStatus {
    let status = &attachment.status;
    if status.attached {
        VolumeStatus {
            name: attachment.volume_name.clone(),
            attached: true,
            disk_uuid: status.disk_uuid.clone(),
            error: None,
        }
    } else {
        VolumeStatus {
            name: attachment.volume_name.clone(),
            attached: false,
            disk_uuid: None,
            error: status.error.clone(),
        }
    }
}
