use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::sync::watch;

use crate::core::ArcStr;
use crate::engine::trace::{ResultType, ShallowTrace, TaskId, Trace, TraceRelationship, now_nanos};
use crate::engine::{TaskRef, Traceable};
use crate::error::{BridgeError, TaskError};

type Thunk<T> = Box<dyn FnOnce(Scope) -> BoxFuture<'static, Result<T, TaskError>> + Send>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Inner<T> {
    id: TaskId,
    name: ArcStr,
    /// Body of the task, taken by whoever executes it first.
    thunk: Mutex<Option<Thunk<T>>>,
    outcome: OnceLock<Result<T, TaskError>>,
    done: watch::Sender<bool>,
    trace: Arc<Mutex<Trace>>,
}

impl<T> Inner<T> {
    fn start(&self) {
        lock(&self.trace).update(self.id, |t| t.start_nanos = Some(now_nanos()));
    }

    fn finish(&self, outcome: Result<T, TaskError>) {
        {
            let mut trace = lock(&self.trace);
            trace.update(self.id, |t| {
                t.end_nanos = Some(now_nanos());
                match &outcome {
                    Ok(_) => t.result = ResultType::Success,
                    Err(err) => {
                        t.result = ResultType::Error;
                        t.value = Some(err.to_string());
                    }
                }
            });
        }

        // The trace is final before anyone can observe completion.
        let _ = self.outcome.set(outcome);
        self.done.send_replace(true);
    }
}

impl<T> Traceable for Inner<T>
where
    T: Send + Sync + 'static,
{
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn trace(&self) -> Trace {
        lock(&self.trace).clone()
    }

    fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    fn completed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.done.subscribe();
        async move {
            let _ = rx.wait_for(|done| *done).await;
        }
        .boxed()
    }
}

/// Handle to the parent task while its body runs.
///
/// Children are run through the scope, which records the parent/child
/// relationship and folds the child's trace into the parent's once the child
/// has finished.
pub struct Scope {
    id: TaskId,
    trace: Arc<Mutex<Trace>>,
}

impl Scope {
    /// Id of the task this scope belongs to.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Runs `child` as part of this task and returns its outcome.
    ///
    /// A child that was already started elsewhere is only awaited.
    pub async fn run<U>(&self, child: &Task<U>) -> Result<U, TaskError>
    where
        U: Clone + Send + Sync + 'static,
    {
        lock(&self.trace).relate(TraceRelationship::ParentOf {
            from: self.id,
            to: child.id(),
        });

        let outcome = child.execute().await;
        let fragment = child.trace();
        lock(&self.trace).merge(&fragment);

        outcome
    }

    /// Records that `to` consumed the result of `from`.
    pub fn follows(&self, from: TaskId, to: TaskId) {
        lock(&self.trace).relate(TraceRelationship::SuccessorOf { from, to });
    }
}

/// A named, lazily executed unit of asynchronous work.
///
/// Constructing a task does nothing; the body runs at most once, either when
/// an [`Engine`](crate::Engine) runs it or when a composite task that depends
/// on it runs. Cloning a task yields another handle to the same execution.
pub struct Task<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn with_thunk(name: &str, thunk: Thunk<T>) -> Self {
        let id = TaskId::next();
        let (done, _) = watch::channel(false);
        let trace = Trace::new([ShallowTrace::pending(id, name)], []);

        Self {
            inner: Arc::new(Inner {
                id,
                name: ArcStr::from(name),
                thunk: Mutex::new(Some(thunk)),
                outcome: OnceLock::new(),
                done,
                trace: Arc::new(Mutex::new(trace)),
            }),
        }
    }

    fn with_body<F, Fut>(name: &str, body: F) -> Self
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self::with_thunk(name, Box::new(move |scope| body(scope).boxed()))
    }

    /// Creates a task from a deferred future producer.
    ///
    /// `producer` is invoked once, when the task is executed, and the task
    /// completes with the outcome of the returned future. A panic in either
    /// the producer or the future fails the task.
    pub fn from_future<F, Fut, E>(name: impl AsRef<str>, producer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        Self::with_body(name.as_ref(), move |_| async move {
            producer().await.map_err(TaskError::new)
        })
    }

    /// Creates a task that runs a synchronous closure.
    pub fn callable<F>(name: impl AsRef<str>, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::with_body(name.as_ref(), move |_| async move { f().map_err(TaskError::new) })
    }

    /// Creates a task that completes with `value`.
    pub fn value(name: impl AsRef<str>, value: T) -> Self {
        Self::with_body(name.as_ref(), move |_| async move { Ok::<_, TaskError>(value) })
    }

    /// Creates a task that fails with `err`.
    pub fn failure(name: impl AsRef<str>, err: impl Into<anyhow::Error>) -> Self {
        let err = TaskError::new(err);
        Self::with_body(name.as_ref(), move |_| async move { Err::<T, _>(err) })
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of the trace fragment, partial while the task is running.
    pub fn trace(&self) -> Trace {
        Traceable::trace(&*self.inner)
    }

    pub fn is_done(&self) -> bool {
        Traceable::is_done(&*self.inner)
    }

    /// The outcome, if the task has completed.
    pub fn outcome(&self) -> Option<Result<T, TaskError>> {
        self.inner.outcome.get().cloned()
    }

    /// Type-erased handle used for trace collection.
    pub fn to_ref(&self) -> TaskRef {
        self.inner.clone()
    }

    /// Waits until the task completes and returns its outcome.
    ///
    /// This does not start the task.
    pub async fn join(&self) -> Result<T, TaskError> {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;

        match self.inner.outcome.get() {
            Some(outcome) => outcome.clone(),
            None => Err(TaskError::new(BridgeError::Unfinished(
                self.inner.name.to_string(),
            ))),
        }
    }

    /// Runs the task body if nobody has started it yet, then waits for the
    /// outcome.
    pub(crate) async fn execute(&self) -> Result<T, TaskError> {
        let thunk = lock(&self.inner.thunk).take();

        if let Some(thunk) = thunk {
            self.inner.start();

            let scope = Scope {
                id: self.inner.id,
                trace: self.inner.trace.clone(),
            };

            let outcome = AssertUnwindSafe(async move { thunk(scope).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(TaskError::from_panic(panic)));

            self.inner.finish(outcome);
        }

        self.join().await
    }

    /// Creates a task applying `f` to the result of this one.
    pub fn map<U, F>(&self, name: impl AsRef<str>, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let source = self.clone();
        Task::with_body(name.as_ref(), move |scope| async move {
            let value = scope.run(&source).await?;
            Ok::<_, TaskError>(f(value))
        })
    }

    /// Creates a task that continues with the task returned by `f`.
    pub fn flat_map<U, F>(&self, name: impl AsRef<str>, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Task<U> + Send + 'static,
    {
        let source = self.clone();
        Task::with_body(name.as_ref(), move |scope| async move {
            let value = scope.run(&source).await?;
            let next = f(value);
            scope.follows(source.id(), next.id());
            scope.run(&next).await
        })
    }

    /// Creates a task that replaces a failure of this one with `f(error)`.
    pub fn recover<F>(&self, name: impl AsRef<str>, f: F) -> Task<T>
    where
        F: FnOnce(TaskError) -> T + Send + 'static,
    {
        let source = self.clone();
        Task::with_body(name.as_ref(), move |scope| async move {
            match scope.run(&source).await {
                Ok(value) => Ok(value),
                Err(err) => Ok::<_, TaskError>(f(err)),
            }
        })
    }

    /// Runs all tasks concurrently and collects their values in order.
    ///
    /// Fails with the first failure in input order, after every task has
    /// finished.
    pub fn par_all(name: impl AsRef<str>, tasks: Vec<Task<T>>) -> Task<Vec<T>> {
        Task::with_body(name.as_ref(), move |scope| async move {
            join_all(tasks.iter().map(|task| scope.run(task)))
                .await
                .into_iter()
                .collect::<Result<Vec<T>, TaskError>>()
        })
    }
}

impl<A> Task<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Runs two tasks concurrently and pairs their values.
    pub fn par<B>(a: &Task<A>, b: &Task<B>) -> Task<(A, B)>
    where
        B: Clone + Send + Sync + 'static,
    {
        let (a, b) = (a.clone(), b.clone());
        Task::with_body("par2", move |scope| async move {
            let (ra, rb) = tokio::join!(scope.run(&a), scope.run(&b));
            Ok::<_, TaskError>((ra?, rb?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_value_and_map() {
        let task = Task::value("five", 5).map("double", |v| v * 2);
        assert_eq!(task.execute().await.unwrap(), 10);
        assert_eq!(task.name(), "double");

        let trace = task.trace();
        assert_eq!(trace.len(), 2);
        assert!(trace.traces().all(|t| t.result == ResultType::Success));
    }

    #[tokio::test]
    async fn test_body_runs_once() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let task = Task::callable("count", move || {
            Ok(c.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        });

        let (a, b) = tokio::join!(task.execute(), task.execute());
        assert_eq!(a.unwrap(), 0);
        assert_eq!(b.unwrap(), 0);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let text = String::from("Test");
        let task = Task::callable("substring", move || Ok(text[5..].to_string()));

        let err = task.execute().await.unwrap_err();
        assert!(err.to_string().starts_with("Task panicked"));

        let record = task.trace().get(task.id()).cloned().unwrap();
        assert_eq!(record.result, ResultType::Error);
        assert!(record.value.is_some());
    }

    #[tokio::test]
    async fn test_recover() {
        let task = Task::<String>::failure("fail", anyhow::anyhow!("nope"))
            .recover("recover", |_| String::from("Recover"));

        assert_eq!(task.execute().await.unwrap(), "Recover");
    }

    #[tokio::test]
    async fn test_par_records_children() {
        let a = Task::value("a", 5);
        let b = Task::value("b", 7);
        let sum = Task::par(&a, &b).map("sum", |(a, b)| a + b);

        assert_eq!(sum.execute().await.unwrap(), 12);

        let trace = sum.trace();
        assert!(trace.contains(a.id()));
        assert!(trace.contains(b.id()));
        assert!(trace.relationships().iter().any(|r| matches!(
            r,
            TraceRelationship::ParentOf { to, .. } if *to == a.id()
        )));
    }

    #[tokio::test]
    async fn test_failed_child_trace_is_kept() {
        let ok = Task::value("ok", 1);
        let bad = Task::<i32>::failure("bad", anyhow::anyhow!("broken"));
        let all = Task::par_all("all", vec![ok.clone(), bad.clone()]);

        assert!(all.execute().await.is_err());

        let trace = all.trace();
        assert_eq!(trace.get(ok.id()).unwrap().result, ResultType::Success);
        assert_eq!(trace.get(bad.id()).unwrap().result, ResultType::Error);
        assert_eq!(trace.get(all.id()).unwrap().result, ResultType::Error);
    }

    #[tokio::test]
    async fn test_flat_map_records_successor() {
        let source = Task::value("source", 3);
        let chained = source.flat_map("chain", |v| Task::value("next", v + 1));

        assert_eq!(chained.execute().await.unwrap(), 4);
        assert!(chained
            .trace()
            .relationships()
            .iter()
            .any(|r| matches!(r, TraceRelationship::SuccessorOf { from, .. } if *from == source.id())));
    }

    #[tokio::test]
    async fn test_to_ref_completion() {
        let task = Task::value("v", ());
        let handle = task.to_ref();
        assert!(!handle.is_done());

        task.execute().await.unwrap();
        handle.completed().await;
        assert!(handle.is_done());
        assert_eq!(handle.name(), "v");
    }
}
