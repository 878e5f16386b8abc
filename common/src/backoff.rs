// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a backoff policy for polling an asynchronous backend task until it
/// reaches a terminal state.
///
/// Polling gives up once `deadline` has elapsed.
pub fn task_poll_policy(deadline: Duration) -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(50);
    const MAX_INTERVAL: Duration = Duration::from_secs(2);
    ExponentialBackoff {
        max_elapsed_time: Some(deadline),
        ..policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL)
    }
}

/// Return a backoff policy for retrying a reconciliation pass that failed
/// with a backend or storage error.
pub fn reconcile_failure_policy() -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(500);
    const MAX_INTERVAL: Duration = Duration::from_secs(5 * 60);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL)
}

/// Return a backoff policy for retrying a reconciliation pass that failed on
/// an unresolvable precondition.
///
/// These only clear once someone fixes the declared resource, so retries
/// start out slower than [reconcile_failure_policy].
pub fn precondition_failure_policy() -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_secs(10);
    const MAX_INTERVAL: Duration = Duration::from_secs(10 * 60);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL)
}

pub fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
) -> ExponentialBackoff {
    let current_interval = initial_interval;
    ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}
