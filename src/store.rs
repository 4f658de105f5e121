//! Request-scoped registry of the tasks run while handling a request.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::context::RequestContext;
use crate::engine::{TaskId, TaskRef, lock};

/// Attribute key under which the task set is stored in the request context.
pub const ARGUMENTS_KEY: &str = "ParSeqTasks";

/// Registry of the tasks run for a request.
pub trait TaskStore: Send + Sync {
    /// Adds `task` to the request's set, creating the set on first use.
    /// Adding the same task twice stores it once.
    fn put(&self, context: &RequestContext, task: TaskRef);

    /// Snapshot of the request's tasks, empty if none were ever stored.
    fn get(&self, context: &RequestContext) -> TaskSet;

    /// Allocates the request's storage slot ahead of the first `put`.
    fn initialize(&self, context: RequestContext) -> RequestContext;
}

/// Thread-safe, append-only task set backing one request.
#[derive(Default)]
struct TaskSlot {
    tasks: Mutex<HashMap<TaskId, TaskRef>>,
}

impl TaskSlot {
    fn insert(&self, task: TaskRef) {
        lock(&self.tasks).entry(task.id()).or_insert(task);
    }

    fn snapshot(&self) -> TaskSet {
        let mut tasks: Vec<_> = lock(&self.tasks).values().cloned().collect();
        tasks.sort_by_key(|task| task.id());
        TaskSet { tasks }
    }
}

/// [`TaskStore`] keeping the task set in the request context's attributes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextTaskStore;

impl ContextTaskStore {
    pub fn new() -> Self {
        Self
    }

    fn slot(&self, context: &RequestContext) -> std::sync::Arc<TaskSlot> {
        context.attribute_or_insert_with(ARGUMENTS_KEY, TaskSlot::default)
    }
}

impl TaskStore for ContextTaskStore {
    fn put(&self, context: &RequestContext, task: TaskRef) {
        tracing::debug!(id = %task.id(), name = task.name(), "registering task");
        self.slot(context).insert(task);
    }

    fn get(&self, context: &RequestContext) -> TaskSet {
        context
            .attribute::<TaskSlot>(ARGUMENTS_KEY)
            .map(|slot| slot.snapshot())
            .unwrap_or_default()
    }

    fn initialize(&self, context: RequestContext) -> RequestContext {
        self.slot(&context);
        context
    }
}

/// Read-only view of the tasks registered for a request, ordered by id.
#[derive(Clone, Default)]
pub struct TaskSet {
    tasks: Vec<TaskRef>,
}

impl TaskSet {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRef> {
        self.tasks.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.iter().map(|task| task.id())
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.iter().any(|task| task.id() == id)
    }
}

impl IntoIterator for TaskSet {
    type Item = TaskRef;
    type IntoIter = std::vec::IntoIter<TaskRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

impl<'a> IntoIterator for &'a TaskSet {
    type Item = &'a TaskRef;
    type IntoIter = std::slice::Iter<'a, TaskRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

impl std::fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tasks.iter().map(|t| (t.id(), t.name().to_string())))
            .finish()
    }
}
