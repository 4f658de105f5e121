use std::any::Any;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::extract::{FromRequestParts, Query};
use axum::http::Uri;
use axum::http::request::Parts;

use crate::engine::lock;

type Dynamic = Arc<dyn Any + Send + Sync>;

struct ContextInner {
    query: HashMap<String, String>,
    attributes: Mutex<HashMap<String, Dynamic>>,
}

/// Per-request state shared by every piece of code handling one request.
///
/// It exposes the request's query parameters and a thread-safe attribute map
/// scoped to the request's lifetime. Clones share the same attributes.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::with_params(std::iter::empty::<(String, String)>())
    }

    pub fn with_params<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            inner: Arc::new(ContextInner {
                query: params
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
                attributes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Builds a context from the query string of `uri`.
    ///
    /// An unparsable query string yields a context without parameters.
    pub fn from_uri(uri: &Uri) -> Self {
        match Query::<HashMap<String, String>>::try_from_uri(uri) {
            Ok(Query(params)) => Self::with_params(params),
            Err(err) => {
                tracing::debug!(%err, "ignoring malformed query string");
                Self::new()
            }
        }
    }

    /// Value of a single query parameter.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.inner.query.get(key).map(String::as_str)
    }

    pub fn attribute<V>(&self, key: &str) -> Option<Arc<V>>
    where
        V: Any + Send + Sync,
    {
        let attributes = lock(&self.inner.attributes);
        attributes.get(key).cloned()?.downcast::<V>().ok()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        lock(&self.inner.attributes).contains_key(key)
    }

    /// Returns the attribute under `key`, storing `init()` first if absent.
    ///
    /// Lookup and insertion happen under one lock, so concurrent callers
    /// always agree on a single value. An existing attribute of another type
    /// is replaced.
    pub fn attribute_or_insert_with<V, F>(&self, key: &str, init: F) -> Arc<V>
    where
        V: Any + Send + Sync,
        F: FnOnce() -> V,
    {
        let mut attributes = lock(&self.inner.attributes);

        if let Some(value) = attributes.get(key).cloned()
            && let Ok(value) = value.downcast::<V>()
        {
            return value;
        }

        let value = Arc::new(init());
        attributes.insert(key.to_string(), value.clone());
        value
    }

    /// Whether both handles refer to the same request.
    pub fn same_request(&self, other: &RequestContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attributes = lock(&self.inner.attributes);
        let mut keys: Vec<_> = attributes.keys().collect();
        keys.sort();

        f.debug_struct("RequestContext")
            .field("query", &self.inner.query)
            .field("attributes", &keys)
            .finish()
    }
}

/// Handlers behind the trace middleware receive the context it initialized;
/// elsewhere a fresh context is built from the request URI.
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_else(|| RequestContext::from_uri(&parts.uri)))
    }
}
