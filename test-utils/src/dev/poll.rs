// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling for a condition that some other task makes true

use std::future::Future;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Result of one check made by [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum CondCheckError<E> {
    /// the condition does not hold yet
    #[error("poll condition not yet ready")]
    NotYet,
    /// the condition can never hold
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(#[source] E),
}

/// Poll `cond` every `poll_interval` until it returns a value, fails, or
/// `poll_max` elapses.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e))
            }
            Err(CondCheckError::NotYet) => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
