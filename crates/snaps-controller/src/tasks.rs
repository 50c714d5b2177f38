//! Background loops owned by a controller: the execution-event listener and the idle sweep.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

/// Restart schedule for a supervised loop that panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Panics further apart than this start again from `initial_backoff`.
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            reset_after: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Give the task `grace` to end on its own, then abort it.
    async fn stop(self, grace: Duration) {
        let TaskHandle { name, mut handle } = self;
        if !grace.is_zero() {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => {
                    debug!(target: "snaps::controller", task = name, error = %err, "task ended with error");
                    return;
                }
                Err(_) => {
                    debug!(target: "snaps::controller", task = name, "task still running after grace, aborting")
                }
            }
        }
        handle.abort();
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                debug!(target: "snaps::controller", task = name, error = %err, "task join after abort failed");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(target: "snaps::controller", task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop every task concurrently, each with the same grace window.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        join_all(self.tasks.into_iter().map(|task| task.stop(grace))).await;
    }
}

/// Spawn a loop that is restarted under the default [`RestartPolicy`] when it panics.
pub fn spawn_supervised<F, Fut>(name: &'static str, factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_supervised_with(name, RestartPolicy::default(), factory)
}

pub fn spawn_supervised_with<F, Fut>(
    name: &'static str,
    policy: RestartPolicy,
    mut factory: F,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut backoff = policy.initial_backoff;
        let mut last_panic: Option<Instant> = None;
        loop {
            if AssertUnwindSafe(factory()).catch_unwind().await.is_ok() {
                debug!(target: "snaps::controller", task = name, "supervised task completed");
                break;
            }
            let now = Instant::now();
            if last_panic.is_some_and(|at| now.duration_since(at) > policy.reset_after) {
                backoff = policy.initial_backoff;
            }
            last_panic = Some(now);
            error!(
                target: "snaps::controller",
                task = name,
                backoff_ms = backoff.as_millis() as u64,
                "supervised task panicked, restarting"
            );
            tokio::time::sleep(backoff).await;
            backoff = policy.next(backoff);
        }
    });
    TaskHandle::new(name, handle)
}
