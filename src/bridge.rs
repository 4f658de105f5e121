//! Conversion between native futures and engine tasks.
//!
//! [`Bridge::to_task`] wraps a deferred future producer into a named
//! [`Task`], and [`Bridge::run_task`] runs a task for a request and hands back
//! a [`PendingValue`], an ordinary future resolving with the task's outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::context::RequestContext;
use crate::core::ArcStr;
use crate::engine::{Engine, Task};
use crate::error::{BridgeError, TaskError};
use crate::store::TaskStore;

/// Name given to tasks converted without an explicit name.
pub const DEFAULT_TASK_NAME: &str = "fromBridgedValue";

/// An asynchronous primitive that can complete a bridged task.
///
/// Implemented for every `Send` future resolving to `Result<T, E>`, which
/// covers plain `async` blocks, [`PendingValue`]s coming out of another
/// bridge, and [`Spawned`] join handles.
pub trait IntoOutcome<T>: Send + 'static {
    fn into_outcome(self) -> BoxFuture<'static, Result<T, TaskError>>;
}

impl<T, E, F> IntoOutcome<T> for F
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<anyhow::Error>,
{
    fn into_outcome(self) -> BoxFuture<'static, Result<T, TaskError>> {
        self.map(|outcome| outcome.map_err(TaskError::new)).boxed()
    }
}

/// Adapter for work already spawned on a tokio runtime.
///
/// A task that panicked or was aborted fails the bridged task.
pub struct Spawned<T, E>(pub JoinHandle<Result<T, E>>);

impl<T, E> Future for Spawned<T, E>
where
    E: Into<anyhow::Error>,
{
    type Output = Result<T, anyhow::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|joined| match joined {
            Ok(outcome) => outcome.map_err(Into::into),
            Err(err) => Err(BridgeError::Join(err).into()),
        })
    }
}

/// The eventual outcome of a task run through [`Bridge::run_task`].
///
/// Resolves exactly once, with the task's value or its error.
#[must_use = "a pending value does nothing unless awaited"]
pub struct PendingValue<T> {
    name: ArcStr,
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

/// Write side of a [`PendingValue`], consumed on resolution.
struct Settle<T>(oneshot::Sender<Result<T, TaskError>>);

impl<T> Settle<T> {
    fn resolve(self, outcome: Result<T, TaskError>) {
        // The caller may have dropped the pending value.
        let _ = self.0.send(outcome);
    }
}

impl<T> PendingValue<T> {
    fn channel(name: &str) -> (Self, Settle<T>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingValue {
            name: ArcStr::from(name),
            rx,
        };
        (pending, Settle(tx))
    }

    /// Name of the task this value is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Future for PendingValue<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let name = self.name.clone();
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::new(BridgeError::Dropped(name.to_string()))),
        })
    }
}

impl<T> std::fmt::Debug for PendingValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingValue")
            .field("name", &self.name)
            .finish()
    }
}

/// Shared body of the `to_task` family.
fn convert<T, F, P>(name: &str, producer: F, executor: Option<Handle>) -> Task<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> P + Send + 'static,
    P: IntoOutcome<T>,
{
    Task::from_future(name, move || {
        let outcome = producer().into_outcome();
        match executor {
            None => outcome,
            Some(executor) => Spawned(executor.spawn(outcome))
                .map(|joined| joined.map_err(TaskError::new))
                .boxed(),
        }
    })
}

/// Entry point for application code: converts futures into tasks and runs
/// tasks on behalf of a request.
#[derive(Clone)]
pub struct Bridge {
    engine: Engine,
    store: Arc<dyn TaskStore>,
}

impl Bridge {
    pub fn new(engine: Engine, store: Arc<dyn TaskStore>) -> Self {
        Self { engine, store }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Wraps a deferred future producer into a task named `name`.
    ///
    /// The producer is called once, when the task is scheduled, and the task
    /// completes with the future's value or fails with its error. A panic in
    /// the producer fails the task instead of unwinding into the engine.
    pub fn to_task<T, F, P>(&self, name: &str, producer: F) -> Task<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> P + Send + 'static,
        P: IntoOutcome<T>,
    {
        convert(name, producer, None)
    }

    /// Like [`to_task`](Self::to_task), named [`DEFAULT_TASK_NAME`].
    pub fn to_task_default<T, F, P>(&self, producer: F) -> Task<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> P + Send + 'static,
        P: IntoOutcome<T>,
    {
        convert(DEFAULT_TASK_NAME, producer, None)
    }

    /// Like [`to_task`](Self::to_task), driving the producer's future on
    /// `executor` instead of the engine's runtime.
    ///
    /// The whole future is spawned onto `executor`, not only the step that
    /// completes the task. The task itself still settles on the engine's
    /// runtime once the spawned future has joined.
    pub fn to_task_on<T, F, P>(&self, name: &str, producer: F, executor: Handle) -> Task<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> P + Send + 'static,
        P: IntoOutcome<T>,
    {
        convert(name, producer, Some(executor))
    }

    /// Runs `task` for the request and returns its eventual outcome.
    ///
    /// The task is registered in the request's task store, so its trace can
    /// be collected later, and submitted to the engine. This never blocks.
    pub fn run_task<T>(&self, context: &RequestContext, task: &Task<T>) -> PendingValue<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (pending, settle) = PendingValue::channel(task.name());

        self.store.put(context, task.to_ref());
        self.engine
            .run_with(task, move |outcome| settle.resolve(outcome));

        pending
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResultType;
    use crate::store::ContextTaskStore;

    fn bridge() -> Bridge {
        Bridge::new(
            Engine::from_current().unwrap(),
            Arc::new(ContextTaskStore::new()),
        )
    }

    fn substring(text: &'static str, start: usize) -> String {
        text[start..].to_string()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_task_with_given_name() {
        let task: Task<String> =
            bridge().to_task("pure", || async { Ok::<_, anyhow::Error>("Test".to_string()) });
        assert_eq!(task.name(), "pure");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_task_with_default_name() {
        let task: Task<String> =
            bridge().to_task_default(|| async { Ok::<_, anyhow::Error>("Test".to_string()) });
        assert_eq!(task.name(), DEFAULT_TASK_NAME);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_convert_with_success() {
        let bridge = bridge();
        let ctx = RequestContext::new();

        let task = bridge.to_task("substring", || {
            Spawned(tokio::spawn(async { Ok::<_, anyhow::Error>(substring("Test", 3)) }))
        });
        let value = bridge.run_task(&ctx, &task).await.unwrap();

        assert_eq!(value, "t");
        assert!(bridge.store().get(&ctx).contains(task.id()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_convert_with_failure() {
        let bridge = bridge();
        let ctx = RequestContext::new();

        let task = bridge.to_task("substring", || {
            Spawned(tokio::spawn(async { Ok::<_, anyhow::Error>(substring("Test", 5)) }))
        });
        let err = bridge.run_task(&ctx, &task).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<BridgeError>(), Some(BridgeError::Join(_))));
        assert_eq!(task.outcome().unwrap().unwrap_err().to_string(), err.to_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_convert_with_recover() {
        let bridge = bridge();
        let ctx = RequestContext::new();

        let task = bridge.to_task("substring", || async {
            "Test".get(5..).map(str::to_string).ok_or_else(|| anyhow::anyhow!("begin 5, end 4"))
        });
        let value = bridge
            .run_task(&ctx, &task)
            .await
            .unwrap_or_else(|_| String::from("Recover"));

        assert_eq!(value, "Recover");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_producer_panic_fails_task() {
        let bridge = bridge();
        let ctx = RequestContext::new();

        let task: Task<String> = bridge.to_task("substring", || {
            let value = substring("Test", 5);
            async move { Ok::<_, anyhow::Error>(value) }
        });
        let err = bridge.run_task(&ctx, &task).await.unwrap_err();

        assert!(err.to_string().starts_with("Task panicked"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_plain_task() {
        let bridge = bridge();
        let ctx = RequestContext::new();

        let ok = Task::callable("test", || Ok(substring("Test", 3)));
        assert_eq!(bridge.run_task(&ctx, &ok).await.unwrap(), "t");

        let bad = Task::callable("test", || Ok(substring("Test", 5)));
        let recovered = bridge
            .run_task(&ctx, &bad)
            .await
            .unwrap_or_else(|_| String::from("Recover"));
        assert_eq!(recovered, "Recover");

        assert_eq!(bridge.store().get(&ctx).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_is_not_an_empty_success() {
        let bridge = bridge();
        let ctx = RequestContext::new();

        let task: Task<Option<u8>> = bridge.to_task("none", || async {
            Err::<Option<u8>, _>(anyhow::anyhow!("no value"))
        });

        let outcome = bridge.run_task(&ctx, &task).await;
        assert!(outcome.is_err());
        assert_eq!(
            task.trace().get(task.id()).unwrap().result,
            ResultType::Error
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_value_bridges_back_with_same_error() {
        let bridge = bridge();
        let ctx = RequestContext::new();

        let first = Task::<u8>::failure("first", anyhow::anyhow!("original"));
        let pending = bridge.run_task(&ctx, &first);

        let second = bridge.to_task("second", move || pending);
        let err = bridge.run_task(&ctx, &second).await.unwrap_err();

        let original = first.outcome().unwrap().unwrap_err();
        assert!(Arc::ptr_eq(&original.0, &err.0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_custom_executor() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bridge-executor")
            .enable_all()
            .build()
            .unwrap();

        let bridge = bridge();
        let ctx = RequestContext::new();

        let task = bridge.to_task_on(
            "on-executor",
            || async {
                Ok::<_, anyhow::Error>(std::thread::current().name().map(str::to_string))
            },
            runtime.handle().clone(),
        );

        let thread = bridge.run_task(&ctx, &task).await.unwrap();
        assert_eq!(thread.as_deref(), Some("bridge-executor"));

        runtime.shutdown_background();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_task_does_not_block() {
        let bridge = bridge();
        let ctx = RequestContext::new();
        let (tx, rx) = oneshot::channel::<u8>();

        let task = bridge.to_task("gated", move || async move { rx.await });
        let pending = bridge.run_task(&ctx, &task);

        // Registration is visible before the task completes.
        assert!(bridge.store().get(&ctx).contains(task.id()));
        assert!(!task.is_done());

        tx.send(9).unwrap();
        assert_eq!(pending.await.unwrap(), 9);
    }
}
