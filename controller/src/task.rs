// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking on asynchronous backend tasks

use crate::backend::BackendClient;
use crate::backend::ObjectRef;
use crate::backend::TaskState;
use slog::trace;
use slog::Logger;
use std::time::Duration;
use vmop_common::api::Error;
use vmop_common::backoff;
use vmop_common::backoff::BackoffError;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task {task} did not complete before its deadline")]
    Incomplete { task: ObjectRef },

    #[error("task {task} failed: {message}")]
    Failed { task: ObjectRef, message: String },

    #[error("failed to read state of task {task}: {err}")]
    Backend {
        task: ObjectRef,
        #[source]
        err: Error,
    },
}

impl From<TaskError> for Error {
    fn from(error: TaskError) -> Error {
        match error {
            TaskError::Incomplete { .. } => {
                Error::incomplete(&error.to_string())
            }
            TaskError::Failed { .. } => {
                Error::internal_error(&error.to_string())
            }
            TaskError::Backend { task, err } => {
                err.internal_context(format!("polling task {}", task))
            }
        }
    }
}

/// Poll `task` until it succeeds, fails, or `deadline` elapses, returning the
/// object the task produced (if any).
///
/// Each individual poll is bounded by `call_timeout`.  Polls that fail with a
/// retryable error are retried like an incomplete task.
pub async fn wait_for_task(
    log: &Logger,
    client: &dyn BackendClient,
    task: &ObjectRef,
    deadline: Duration,
    call_timeout: Duration,
) -> Result<Option<ObjectRef>, TaskError> {
    let poll = move || async move {
        let state =
            match tokio::time::timeout(call_timeout, client.task_state(task))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::unavail("timed out reading task state")),
            }
            .map_err(|err| {
                let retryable = err.retryable();
                let err = TaskError::Backend { task: task.clone(), err };
                if retryable {
                    BackoffError::transient(err)
                } else {
                    BackoffError::permanent(err)
                }
            })?;

        match state {
            TaskState::Queued | TaskState::Running => {
                Err(BackoffError::transient(TaskError::Incomplete {
                    task: task.clone(),
                }))
            }
            TaskState::Success { result } => Ok(result),
            TaskState::Error { message } => {
                Err(BackoffError::permanent(TaskError::Failed {
                    task: task.clone(),
                    message,
                }))
            }
        }
    };
    let log_progress = |error: TaskError, delay: Duration| {
        trace!(log, "task not finished";
            "task" => %task,
            "status" => %error,
            "retry_after" => ?delay,
        );
    };

    backoff::retry_notify(
        backoff::task_poll_policy(deadline),
        poll,
        log_progress,
    )
    .await
}
