//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task;
use tokio::time::Instant;
use tracing::Instrument;

/// Handle to a task created by [`Task::spawn`].
///
/// Dropping the handle aborts the task.
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
}

/// Handle to a one-shot timer created by [`TimeoutTask::new`].
///
/// Dropping the handle cancels the timer. The controller relies on this to
/// implement "at most one scheduled action" semantics: holding an
/// `Option<TimeoutTask>` is the scheduled state.
#[derive(Debug)]
pub struct TimeoutTask {
    _task: Task<()>,
    deadline: Instant,
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    /// Spawns a timer that runs `cb` once `timeout` has elapsed.
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let task = Task::spawn(
            async move {
                tokio::time::sleep_until(deadline).await;
                (cb)().await;
            }
            .in_current_span(),
        );

        TimeoutTask {
            _task: task,
            deadline,
        }
    }

    /// Returns the time left before the timer fires.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
