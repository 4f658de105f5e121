use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::response::Response;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};

use crate::context::RequestContext;
use crate::engine::TaskId;
use crate::store::TaskStore;
use crate::trace::renderer::TraceRenderer;
use crate::trace::sensor::TraceSensor;

/// Upper bound on how many times the registry is re-read while waiting for
/// tasks registered by other tasks.
pub const MAX_SETTLE_ROUNDS: usize = 16;

/// Decides between a request's normal response and its trace page.
pub trait TraceBuilder: Send + Sync {
    fn build(
        &self,
        context: RequestContext,
        origin: BoxFuture<'static, Response>,
        store: Arc<dyn TaskStore>,
        sensor: Arc<dyn TraceSensor>,
        renderer: Arc<dyn TraceRenderer>,
    ) -> BoxFuture<'static, Response>;
}

/// Waits for the normal response and every task of the request, then renders
/// the trace in place of the response.
///
/// The sensor is consulted once the normal response is ready, since handler
/// futures do not run, and so register nothing, before they are polled. When
/// tracing is disabled the normal response is returned as it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParSeqTraceBuilder;

impl ParSeqTraceBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl TraceBuilder for ParSeqTraceBuilder {
    fn build(
        &self,
        context: RequestContext,
        origin: BoxFuture<'static, Response>,
        store: Arc<dyn TaskStore>,
        sensor: Arc<dyn TraceSensor>,
        renderer: Arc<dyn TraceRenderer>,
    ) -> BoxFuture<'static, Response> {
        async move {
            let response = match AssertUnwindSafe(origin).catch_unwind().await {
                Ok(response) => response,
                Err(panic) if !sensor.is_enabled(&context, &*store) => {
                    std::panic::resume_unwind(panic)
                }
                Err(_) => {
                    tracing::debug!("handler panicked, rendering its trace");
                    return trace_page(&context, &store, &*renderer).await;
                }
            };

            if !sensor.is_enabled(&context, &*store) {
                return response;
            }

            // The normal response is discarded, but its body is produced by the
            // handler and may still drive work of its own.
            if let Err(err) = axum::body::to_bytes(response.into_body(), usize::MAX).await {
                tracing::debug!(%err, "ignoring failure while draining the response body");
            }

            trace_page(&context, &store, &*renderer).await
        }
        .boxed()
    }
}

async fn trace_page(
    context: &RequestContext,
    store: &Arc<dyn TaskStore>,
    renderer: &dyn TraceRenderer,
) -> Response {
    let count = settle(context, &**store).await;
    tracing::info!(tasks = count, "building trace page");
    renderer.render(context, store).await
}

/// Waits until every task in the registry has completed.
///
/// Tasks may register further tasks while they run, so after each round the
/// registry is read again and any newcomers are awaited too. Returns the
/// number of tasks awaited.
async fn settle(context: &RequestContext, store: &dyn TaskStore) -> usize {
    let mut seen: HashSet<TaskId> = HashSet::new();

    for _ in 0..MAX_SETTLE_ROUNDS {
        let fresh: Vec<_> = store
            .get(context)
            .into_iter()
            .filter(|task| seen.insert(task.id()))
            .collect();

        if fresh.is_empty() {
            break;
        }

        join_all(fresh.iter().map(|task| task.completed())).await;
    }

    seen.len()
}
