//! The task engine.
//!
//! A [`Task`] is a named unit of asynchronous work that runs at most once and
//! records a trace fragment of its execution. Tasks are composed with
//! [`Task::map`], [`Task::flat_map`], [`Task::par`] and friends, and submitted
//! for execution with [`Engine::run`].

mod task;
mod trace;

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::Instrument;

use crate::error::{BridgeError, TaskError};

pub use crate::engine::task::{Scope, Task};
pub(crate) use crate::engine::task::lock;
pub use crate::engine::trace::{ResultType, ShallowTrace, TaskId, Trace, TraceRelationship};

/// Type-erased view of a task, enough to collect its trace.
pub trait Traceable: Send + Sync {
    fn id(&self) -> TaskId;

    fn name(&self) -> &str;

    /// Snapshot of the trace fragment.
    fn trace(&self) -> Trace;

    fn is_done(&self) -> bool;

    /// Resolves once the task has completed, whatever the outcome.
    fn completed(&self) -> BoxFuture<'static, ()>;
}

/// Shared, type-erased task handle.
pub type TaskRef = Arc<dyn Traceable>;

/// Submits tasks for execution on a tokio runtime.
#[derive(Debug, Clone)]
pub struct Engine {
    handle: Handle,
}

impl Engine {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    pub fn from_current() -> Result<Self, BridgeError> {
        Ok(Self::new(Handle::try_current()?))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Starts `task` in the background and returns immediately.
    pub fn run<T>(&self, task: &Task<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.run_with(task, |_| {});
    }

    /// Starts `task` in the background and hands its outcome to `callback`.
    pub fn run_with<T, F>(&self, task: &Task<T>, callback: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let task = task.clone();
        let span = tracing::debug_span!("task", id = %task.id(), name = task.name());

        self.handle.spawn(
            async move {
                tracing::debug!("running task");
                let outcome = task.execute().await;
                if let Err(err) = &outcome {
                    tracing::debug!(%err, "task failed");
                }
                callback(outcome);
            }
            .instrument(span),
        );
    }
}
