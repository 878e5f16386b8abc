// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status conditions recorded on a virtual machine

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// The aspect of a virtual machine a [`Condition`] describes
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ConditionType {
    /// Every object the machine references resolved and is accessible from
    /// its namespace.
    #[serde(rename = "VirtualMachinePrereqReady")]
    PrereqReady,
    /// The machine exists on the backend.
    #[serde(rename = "VirtualMachineProvisioned")]
    Provisioned,
    /// Every declared volume reached a terminal attachment state.
    #[serde(rename = "VirtualMachineVolumesReady")]
    VolumesReady,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ConditionStatus {
    True,
    False,
}

/// Machine-readable explanation for a false condition
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ConditionReason {
    #[serde(rename = "VirtualMachineClassNotFound")]
    ClassNotFound,
    #[serde(rename = "VirtualMachineClassBindingNotFound")]
    ClassBindingNotFound,
    #[serde(rename = "VirtualMachineImageNotFound")]
    ImageNotFound,
    ContentLibraryProviderNotFound,
    ContentSourceBindingNotFound,
    #[serde(rename = "VirtualMachineMetadataNotFound")]
    MetadataNotFound,
    #[serde(rename = "VirtualMachineMetadataInvalid")]
    MetadataInvalid,
    ResourcePolicyNotFound,
    NoPlacementFound,
    PlacementFaulted,
    BackendError,
    VolumeAttachmentPending,
    VolumeAttachmentFailed,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
    None,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: Option<ConditionReason>,
    pub severity: ConditionSeverity,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// A condition reporting that `condition_type` holds
    pub fn ready(condition_type: ConditionType) -> Condition {
        Condition {
            condition_type,
            status: ConditionStatus::True,
            reason: None,
            severity: ConditionSeverity::None,
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    /// A condition reporting that `condition_type` does not hold, and why
    pub fn failed(
        condition_type: ConditionType,
        reason: ConditionReason,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Condition {
        Condition {
            condition_type,
            status: ConditionStatus::False,
            reason: Some(reason),
            severity,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Record `condition` in `conditions`, replacing any existing condition of
/// the same type.
///
/// The transition time of the existing condition is kept unless the status
/// flipped, so recording the same condition twice leaves `conditions`
/// unchanged.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    mut condition: Condition,
) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Look up the condition of type `condition_type`, if any
pub fn find_condition(
    conditions: &[Condition],
    condition_type: ConditionType,
) -> Option<&Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}
