// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the convergence controller

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FormatResult;

/// An error that can be generated by the control-plane store or the
/// virtualization backend
///
/// Components translate their own failures into these variants at their
/// boundary so that callers can classify an error (not found, transient,
/// precondition) without knowing which collaborator produced it.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {lookup_type:?}) not found: {type_name}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// An object already exists with the specified name.
    #[error("Object (of type {type_name:?}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// The request was well-formed, but the operation cannot be completed
    /// given the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// The backend rejected the credentials used to establish or use a
    /// session.
    #[error("Missing or invalid credentials")]
    Unauthenticated { internal_message: String },
    /// The specified input field is not valid.
    #[error("Invalid Value: {label}, {message}")]
    InvalidValue { label: String, message: String },
    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },
    /// The backend accepted the operation but it has not finished yet.
    #[error("Operation Incomplete: {internal_message}")]
    Incomplete { internal_message: String },
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific name was requested
    ByName(String),
    /// a specific object was requested with some composite key
    /// (caller summarizes it)
    ByCompositeId(String),
}

impl LookupType {
    /// Returns an ObjectNotFound error appropriate for the case where this
    /// lookup failed
    pub fn into_not_found(self, type_name: ResourceType) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: self }
    }
}

impl From<&str> for LookupType {
    fn from(name: &str) -> Self {
        LookupType::ByName(name.to_owned())
    }
}

/// Identifies a type of resource, either in the control-plane store or on
/// the virtualization backend
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ResourceType {
    VirtualMachine,
    VirtualMachineClass,
    VirtualMachineClassBinding,
    VirtualMachineImage,
    ContentLibraryProvider,
    ContentSourceBinding,
    ConfigMap,
    Secret,
    ResourcePolicy,
    VolumeAttachment,
    BackendVirtualMachine,
    BackendResourcePool,
    BackendFolder,
    BackendTask,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                ResourceType::VirtualMachine => "virtual machine",
                ResourceType::VirtualMachineClass => "virtual machine class",
                ResourceType::VirtualMachineClassBinding => {
                    "virtual machine class binding"
                }
                ResourceType::VirtualMachineImage => "virtual machine image",
                ResourceType::ContentLibraryProvider => {
                    "content library provider"
                }
                ResourceType::ContentSourceBinding => "content source binding",
                ResourceType::ConfigMap => "config map",
                ResourceType::Secret => "secret",
                ResourceType::ResourcePolicy => "resource policy",
                ResourceType::VolumeAttachment => "volume attachment",
                ResourceType::BackendVirtualMachine => "backend vm",
                ResourceType::BackendResourcePool => "resource pool",
                ResourceType::BackendFolder => "vm folder",
                ResourceType::BackendTask => "backend task",
            }
        )
    }
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable { .. } | Error::Incomplete { .. } => true,

            Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::Unauthenticated { .. }
            | Error::InvalidRequest { .. }
            | Error::InvalidValue { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Returns whether this is an [`Error::ObjectNotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ObjectNotFound { .. })
    }

    /// Returns whether a session that produced this error should be thrown
    /// away and re-established
    ///
    /// Both authentication failures and connectivity failures (which surface
    /// as [`Error::ServiceUnavailable`]) may mean the session itself is no
    /// longer usable.  A slow operation ([`Error::Incomplete`]) says nothing
    /// about the session.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Error::Unauthenticated { .. } | Error::ServiceUnavailable { .. }
        )
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object
    /// name.
    pub fn not_found_by_name(type_name: ResourceType, name: &str) -> Error {
        LookupType::from(name).into_not_found(type_name)
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should
    /// not happen but that we cannot reasonably handle at runtime.
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    pub fn invalid_request(message: impl Into<String>) -> Error {
        Error::InvalidRequest { message: message.into() }
    }

    /// Generates an [`Error::InvalidValue`] error for the field `label`
    pub fn invalid_value(
        label: impl Into<String>,
        message: impl Into<String>,
    ) -> Error {
        Error::InvalidValue { label: label.into(), message: message.into() }
    }

    /// Generates an [`Error::ServiceUnavailable`] error with the specific
    /// message
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { internal_message: message.to_owned() }
    }

    /// Generates an [`Error::Incomplete`] error with the specific message
    pub fn incomplete(message: &str) -> Error {
        Error::Incomplete { internal_message: message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same error
    /// with `context` prepended to it to provide more context
    ///
    /// If the error has no internal message, then it is returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::InvalidValue { .. } => self,
            Error::Unauthenticated { internal_message } => {
                Error::Unauthenticated {
                    internal_message: format!(
                        "{}: {}",
                        context, internal_message
                    ),
                }
            }
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::ServiceUnavailable { internal_message } => {
                Error::ServiceUnavailable {
                    internal_message: format!(
                        "{}: {}",
                        context, internal_message
                    ),
                }
            }
            Error::Incomplete { internal_message } => Error::Incomplete {
                internal_message: format!("{}: {}", context, internal_message),
            },
        }
    }
}

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResult<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;
