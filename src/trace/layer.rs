use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use futures::FutureExt;

use crate::context::RequestContext;
use crate::core::Environment;
use crate::store::TaskStore;
use crate::trace::builder::{ParSeqTraceBuilder, TraceBuilder};
use crate::trace::renderer::{HtmlTraceRenderer, TraceRenderer};
use crate::trace::sensor::{QueryTraceSensor, TraceSensor};

/// Components used by the [`parseq_trace`] middleware.
///
/// ```ignore
/// let router = ParSeqTraceLayer::new(environment, store).wrap(router);
/// ```
#[derive(Clone)]
pub struct ParSeqTraceLayer {
    store: Arc<dyn TaskStore>,
    builder: Arc<dyn TraceBuilder>,
    sensor: Arc<dyn TraceSensor>,
    renderer: Arc<dyn TraceRenderer>,
}

impl ParSeqTraceLayer {
    /// Default components: query-driven sensor, HTML renderer.
    pub fn new(environment: Environment, store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            builder: Arc::new(ParSeqTraceBuilder::new()),
            sensor: Arc::new(QueryTraceSensor::new(environment.clone())),
            renderer: Arc::new(HtmlTraceRenderer::new(environment)),
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn TraceBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_sensor(mut self, sensor: Arc<dyn TraceSensor>) -> Self {
        self.sensor = sensor;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TraceRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Puts every route of `router` behind the trace middleware.
    pub fn wrap<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(middleware::from_fn_with_state(self, parseq_trace))
    }
}

/// Middleware giving each request a fresh [`RequestContext`] with an
/// initialized task store, and passing the handler's response through the
/// trace builder.
pub async fn parseq_trace(
    State(layer): State<ParSeqTraceLayer>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = layer.store.initialize(RequestContext::from_uri(request.uri()));
    request.extensions_mut().insert(context.clone());

    let origin = next.run(request).boxed();

    layer
        .builder
        .build(context, origin, layer.store, layer.sensor, layer.renderer)
        .await
}
