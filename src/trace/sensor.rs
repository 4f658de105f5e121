use crate::context::RequestContext;
use crate::core::Environment;
use crate::store::TaskStore;

/// Query parameter that requests a trace page instead of the normal response.
pub const QUERY_KEY: &str = "parseq-trace";

/// Decides whether a request should be answered with its trace.
pub trait TraceSensor: Send + Sync {
    fn is_enabled(&self, context: &RequestContext, store: &dyn TaskStore) -> bool;
}

/// Enables tracing for requests carrying `parseq-trace=true`, in development
/// mode only, and only when the request actually ran some tasks.
#[derive(Debug, Clone, Default)]
pub struct QueryTraceSensor {
    environment: Environment,
}

impl QueryTraceSensor {
    pub fn new(environment: Environment) -> Self {
        Self { environment }
    }
}

impl TraceSensor for QueryTraceSensor {
    fn is_enabled(&self, context: &RequestContext, store: &dyn TaskStore) -> bool {
        self.environment.is_dev()
            && context.query(QUERY_KEY) == Some("true")
            && !store.get(context).is_empty()
    }
}
