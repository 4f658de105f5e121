use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::context::RequestContext;
use crate::core::Environment;
use crate::engine::Trace;
use crate::store::{TaskSet, TaskStore};
use crate::trace::visualizer::TraceView;

/// Body of the response sent when no trace page could be produced.
pub const CANT_SHOW_TRACE: &str = "Can't show Trace.";

/// Produces the response that replaces a traced request's normal response.
pub trait TraceRenderer: Send + Sync {
    fn render(&self, context: &RequestContext, store: &Arc<dyn TaskStore>) -> BoxFuture<'static, Response>;
}

/// Turns a merged trace into a page, if it can.
pub trait TraceVisualizer: Send + Sync {
    fn show(&self, trace: &Trace, environment: &Environment) -> Option<String>;
}

/// Merges the trace fragments of every task in `tasks` into one graph.
pub fn merge_traces(tasks: &TaskSet) -> Trace {
    tasks.iter().fold(Trace::default(), |mut merged, task| {
        merged.merge(&task.trace());
        merged
    })
}

/// Renders the merged trace of a request as an HTML page.
#[derive(Clone)]
pub struct HtmlTraceRenderer {
    environment: Environment,
    visualizer: Arc<dyn TraceVisualizer>,
}

impl HtmlTraceRenderer {
    pub fn new(environment: Environment) -> Self {
        Self::with_visualizer(environment, Arc::new(TraceView))
    }

    pub fn with_visualizer(environment: Environment, visualizer: Arc<dyn TraceVisualizer>) -> Self {
        Self {
            environment,
            visualizer,
        }
    }
}

impl TraceRenderer for HtmlTraceRenderer {
    fn render(&self, context: &RequestContext, store: &Arc<dyn TaskStore>) -> BoxFuture<'static, Response> {
        let context = context.clone();
        let store = store.clone();
        let environment = self.environment.clone();
        let visualizer = self.visualizer.clone();

        async move {
            let page = tokio::task::spawn_blocking(move || {
                let trace = merge_traces(&store.get(&context));
                visualizer.show(&trace, &environment)
            })
            .await;

            match page {
                Ok(Some(html)) => Html(html).into_response(),
                Ok(None) => {
                    tracing::warn!("trace could not be visualized");
                    cant_show_trace()
                }
                Err(err) => {
                    tracing::warn!(%err, "merging traces failed");
                    cant_show_trace()
                }
            }
        }
        .boxed()
    }
}

fn cant_show_trace() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, CANT_SHOW_TRACE).into_response()
}
