//! Per-request trace pages.
//!
//! A request passing through [`parseq_trace`] gets a fresh [`RequestContext`]
//! with an initialized task store. Once the handler has answered, the
//! [`TraceSensor`] decides whether the answer is kept, or whether the builder
//! waits for every task of the request and the [`TraceRenderer`] replaces the
//! answer with the merged trace of those tasks.
//!
//! [`RequestContext`]: crate::RequestContext

mod builder;
mod layer;
mod renderer;
mod sensor;
mod visualizer;

pub use builder::{MAX_SETTLE_ROUNDS, ParSeqTraceBuilder, TraceBuilder};
pub use layer::{ParSeqTraceLayer, parseq_trace};
pub use renderer::{CANT_SHOW_TRACE, HtmlTraceRenderer, TraceRenderer, TraceVisualizer, merge_traces};
pub use sensor::{QUERY_KEY, QueryTraceSensor, TraceSensor};
pub use visualizer::TraceView;
