// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asking the backend where a new machine should go
//!
//! The backend does the actual placement.  This module only shapes the
//! request and throws away any part of the answer the controller cannot act
//! on: a recommendation is usable only if it carries the reason code for the
//! kind of placement requested and names both a resource pool and a host.

use crate::backend::BackendRecommendation;
use crate::backend::ObjectRef;
use crate::backend::PlacementAction;
use crate::backend::PlacementCandidate;
use crate::backend::PlacementFault;
use crate::backend::PlacementRequest;
use crate::backend::PlacementResponse;
use crate::backend::PlacementTarget;
use crate::backend::RecommendationReason;
use crate::session::Session;
use slog::debug;
use slog::Logger;
use vmop_common::api::Error;

/// Where to create a machine
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Recommendation {
    pub pool: ObjectRef,
    pub host: ObjectRef,
}

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("placement request failed: {0}")]
    Backend(#[source] Error),

    #[error("{}", describe_faults(.0))]
    Faulted(Vec<PlacementFault>),

    #[error("no valid placement action")]
    NoValidPlacement,
}

impl PlacementError {
    /// Returns the backend error, if the request itself failed
    pub fn backend_error(&self) -> Option<&Error> {
        match self {
            PlacementError::Backend(e) => Some(e),
            PlacementError::Faulted(_) | PlacementError::NoValidPlacement => {
                None
            }
        }
    }
}

fn describe_faults(faults: &[PlacementFault]) -> String {
    faults
        .iter()
        .map(|fault| {
            format!(
                "ResourcePool {} faults: {}",
                fault.pool,
                fault.messages.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// The reason code a usable recommendation must carry for `target`
pub fn expected_reason(target: &PlacementTarget) -> RecommendationReason {
    match target {
        PlacementTarget::Cluster(_) => RecommendationReason::XvmotionPlacement,
        PlacementTarget::ResourcePools(_) => {
            RecommendationReason::XClusterPlacement
        }
    }
}

/// Ask the backend where to place `candidate` within `target`.
///
/// Returns every usable recommendation, in the order the backend gave them.
/// An empty result is not an error here; see [`choose`].
pub async fn resolve(
    log: &Logger,
    session: &Session,
    target: &PlacementTarget,
    candidate: &PlacementCandidate,
) -> Result<Vec<Recommendation>, PlacementError> {
    let request = PlacementRequest {
        target: target.clone(),
        candidate: candidate.clone(),
    };
    let response =
        session.place_vm(&request).await.map_err(PlacementError::Backend)?;
    debug!(log, "placement response";
        "recommendations" => response.recommendations.len(),
        "faults" => response.faults.len(),
    );
    usable_recommendations(&expected_reason(target), response)
}

/// Filter a placement response down to its usable recommendations.
///
/// Any fault fails the whole request; partial answers are not acted on.
pub fn usable_recommendations(
    reason: &RecommendationReason,
    response: PlacementResponse,
) -> Result<Vec<Recommendation>, PlacementError> {
    if !response.faults.is_empty() {
        return Err(PlacementError::Faulted(response.faults));
    }

    Ok(response
        .recommendations
        .into_iter()
        .filter(|r| &r.reason == reason)
        .flat_map(|r: BackendRecommendation| r.actions)
        .filter_map(|action| match action {
            PlacementAction::Placement {
                pool: Some(pool),
                host: Some(host),
            } => Some(Recommendation { pool, host }),
            PlacementAction::Placement { .. }
            | PlacementAction::Other { .. } => None,
        })
        .collect())
}

/// Pick the recommendation to act on.
pub fn choose(
    recommendations: Vec<Recommendation>,
) -> Result<Recommendation, PlacementError> {
    recommendations.into_iter().next().ok_or(PlacementError::NoValidPlacement)
}
