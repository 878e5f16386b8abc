// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolving the objects a machine references
//!
//! All of these are checked before the backend is contacted, so that a
//! machine with a dangling reference fails fast with a condition explaining
//! what is missing.

use crate::store::Store;
use std::collections::BTreeMap;
use vmop_common::api::Condition;
use vmop_common::api::ConditionReason;
use vmop_common::api::ConditionSeverity;
use vmop_common::api::ConditionType;
use vmop_common::api::ContentLibraryProvider;
use vmop_common::api::Error;
use vmop_common::api::MetadataSourceKind;
use vmop_common::api::MetadataTransport;
use vmop_common::api::VirtualMachine;
use vmop_common::api::VirtualMachineClass;
use vmop_common::api::VirtualMachineImage;
use vmop_common::api::VirtualMachineSetResourcePolicy;

/// Guest metadata read from the machine's config map or secret
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedMetadata {
    pub transport: MetadataTransport,
    pub data: BTreeMap<String, String>,
}

/// Everything a machine references, resolved
#[derive(Clone, Debug)]
pub struct Prerequisites {
    pub class: VirtualMachineClass,
    pub image: VirtualMachineImage,
    pub provider: ContentLibraryProvider,
    pub metadata: Option<ResolvedMetadata>,
    pub resource_policy: Option<VirtualMachineSetResourcePolicy>,
}

#[derive(Debug, thiserror::Error)]
pub enum PrereqError {
    #[error("Failed to get VirtualMachineClass: {name}")]
    ClassNotFound { name: String },

    #[error(
        "Namespace {namespace} does not have access to \
         VirtualMachineClass {class}"
    )]
    ClassBindingNotFound { namespace: String, class: String },

    #[error("Failed to get VirtualMachineImage: {name}")]
    ImageNotFound { name: String },

    #[error(
        "Failed to get ContentLibraryProvider {provider} for \
         VirtualMachineImage {image}"
    )]
    ProviderNotFound { provider: String, image: String },

    #[error(
        "Namespace {namespace} does not have access to ContentSource \
         {content_source} for VirtualMachineImage {image}"
    )]
    ContentSourceBindingNotFound {
        namespace: String,
        content_source: String,
        image: String,
    },

    #[error("Failed to get VM Metadata {kind:?} {name}")]
    MetadataNotFound { kind: MetadataSourceKind, name: String },

    #[error("invalid VM Metadata: {message}")]
    MetadataInvalid { message: String },

    #[error("Failed to get VirtualMachineSetResourcePolicy: {name}")]
    ResourcePolicyNotFound { name: String },

    #[error("failed to read prerequisites: {0}")]
    Store(#[source] Error),
}

impl PrereqError {
    /// Returns the condition recording this failure on the machine, if the
    /// failure is one the declaring party has to fix
    pub fn condition(&self) -> Option<Condition> {
        let reason = match self {
            PrereqError::ClassNotFound { .. } => ConditionReason::ClassNotFound,
            PrereqError::ClassBindingNotFound { .. } => {
                ConditionReason::ClassBindingNotFound
            }
            PrereqError::ImageNotFound { .. } => ConditionReason::ImageNotFound,
            PrereqError::ProviderNotFound { .. } => {
                ConditionReason::ContentLibraryProviderNotFound
            }
            PrereqError::ContentSourceBindingNotFound { .. } => {
                ConditionReason::ContentSourceBindingNotFound
            }
            PrereqError::MetadataNotFound { .. } => {
                ConditionReason::MetadataNotFound
            }
            PrereqError::MetadataInvalid { .. } => {
                ConditionReason::MetadataInvalid
            }
            PrereqError::ResourcePolicyNotFound { .. } => {
                ConditionReason::ResourcePolicyNotFound
            }
            PrereqError::Store(_) => return None,
        };
        Some(Condition::failed(
            ConditionType::PrereqReady,
            reason,
            ConditionSeverity::Error,
            self.to_string(),
        ))
    }
}

/// Map a store lookup failure: not-found becomes `missing`, anything else is
/// a store error.
fn lookup_err(
    missing: impl FnOnce() -> PrereqError,
) -> impl FnOnce(Error) -> PrereqError {
    move |e| if e.is_not_found() { missing() } else { PrereqError::Store(e) }
}

/// Resolve every object `vm` references.
pub async fn resolve(
    store: &dyn Store,
    vm: &VirtualMachine,
) -> Result<Prerequisites, PrereqError> {
    let namespace = &vm.metadata.namespace;
    let spec = &vm.spec;

    let class = store.virtual_machine_class(&spec.class_name).await.map_err(
        lookup_err(|| PrereqError::ClassNotFound {
            name: spec.class_name.clone(),
        }),
    )?;
    store.class_binding(namespace, &class.name).await.map_err(lookup_err(
        || PrereqError::ClassBindingNotFound {
            namespace: namespace.clone(),
            class: class.name.clone(),
        },
    ))?;

    let image = store.virtual_machine_image(&spec.image_name).await.map_err(
        lookup_err(|| PrereqError::ImageNotFound {
            name: spec.image_name.clone(),
        }),
    )?;
    let provider = store
        .content_library_provider(&image.provider_ref)
        .await
        .map_err(lookup_err(|| PrereqError::ProviderNotFound {
            provider: image.provider_ref.clone(),
            image: image.name.clone(),
        }))?;
    store
        .content_source_binding(namespace, &provider.content_source)
        .await
        .map_err(lookup_err(|| PrereqError::ContentSourceBindingNotFound {
            namespace: namespace.clone(),
            content_source: provider.content_source.clone(),
            image: image.name.clone(),
        }))?;

    let metadata = match &spec.vm_metadata {
        None => None,
        Some(m) => {
            let (kind, name) = match (&m.config_map_name, &m.secret_name) {
                (Some(name), None) => (MetadataSourceKind::ConfigMap, name),
                (None, Some(name)) => (MetadataSourceKind::Secret, name),
                (Some(_), Some(_)) => {
                    return Err(PrereqError::MetadataInvalid {
                        message: String::from(
                            "configMapName and secretName are mutually \
                             exclusive",
                        ),
                    });
                }
                (None, None) => {
                    return Err(PrereqError::MetadataInvalid {
                        message: String::from(
                            "one of configMapName or secretName is required",
                        ),
                    });
                }
            };
            let source = store
                .metadata_source(namespace, kind, name)
                .await
                .map_err(lookup_err(|| PrereqError::MetadataNotFound {
                    kind,
                    name: name.clone(),
                }))?;
            Some(ResolvedMetadata { transport: m.transport, data: source.data })
        }
    };

    let resource_policy = match &spec.resource_policy_name {
        None => None,
        Some(name) => Some(
            store.resource_policy(namespace, name).await.map_err(
                lookup_err(|| PrereqError::ResourcePolicyNotFound {
                    name: name.clone(),
                }),
            )?,
        ),
    };

    Ok(Prerequisites { class, image, provider, metadata, resource_policy })
}
