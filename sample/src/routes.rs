use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use serde::Deserialize;
use tracebridge::trace::ParSeqTraceLayer;
use tracebridge::{Bridge, Environment, RequestContext, Task, TaskError, TaskStore};

/// Answer of the core-only sample when the start index is out of range.
pub const DEFAULT_FAILURE: &str = "Start Index Error";

const INPUT: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Core only sample</title></head>
<body>
<form action="core-only" method="get">
    <label>Text <input name="text" value="Hello World"></label>
    <label>Start <input name="start" type="number" value="6"></label>
    <button>Substring</button>
</form>
</body>
</html>"#;

/// The sample application. Only the task samples sit behind the trace
/// middleware, the core-only sample uses the bridge alone.
pub fn router(bridge: Bridge, store: Arc<dyn TaskStore>, environment: Environment) -> Router {
    let traced = Router::new()
        .route("/single-task", get(single_task))
        .route("/multiple-tasks", get(multiple_tasks));

    Router::new()
        .route("/", get(input))
        .route("/core-only", get(core_only))
        .merge(ParSeqTraceLayer::new(environment, store).wrap(traced))
        .with_state(bridge)
}

fn internal(err: TaskError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn input() -> Html<&'static str> {
    Html(INPUT)
}

#[derive(Debug, Deserialize)]
struct Substring {
    text: String,
    start: usize,
}

async fn core_only(
    State(bridge): State<Bridge>,
    ctx: RequestContext,
    Query(Substring { text, start }): Query<Substring>,
) -> String {
    let substring = bridge.to_task("substring", move || async move {
        text.get(start..)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("begin {start}, length {}", text.len()))
    });

    bridge
        .run_task(&ctx, &substring)
        .await
        .unwrap_or_else(|_| DEFAULT_FAILURE.to_string())
}

async fn single_task(
    State(bridge): State<Bridge>,
    ctx: RequestContext,
) -> Result<String, (StatusCode, String)> {
    let hello = bridge.to_task("hello", || async { Ok::<_, anyhow::Error>("Hello") });
    let world = Task::value("world", "World");
    let greeting = Task::par(&hello, &world).map("greeting", |(h, w)| format!("{h} {w}"));

    bridge.run_task(&ctx, &greeting).await.map_err(internal)
}

// Remote pages are simulated, so the sample runs offline.

fn page(url: &str) -> String {
    format!("<html><body>{url}</body></html>")
}

async fn fetch(url: &'static str, latency: Duration) -> anyhow::Result<String> {
    tokio::time::sleep(latency).await;
    Ok(page(url))
}

fn length_task(bridge: &Bridge, url: &'static str, latency: Duration) -> Task<usize> {
    bridge
        .to_task("fetch", move || fetch(url, latency))
        .map(url, |body: String| body.len())
}

async fn multiple_tasks(
    State(bridge): State<Bridge>,
    ctx: RequestContext,
) -> Result<String, (StatusCode, String)> {
    // Runs alongside the request, shows up only in the trace.
    let yahoo = length_task(&bridge, "http://www.yahoo.com", Duration::from_millis(120));
    drop(bridge.run_task(&ctx, &yahoo));

    let bing = bridge.to_task("http://www.bing.com", || async {
        let body = fetch("http://www.bing.com", Duration::from_millis(40)).await?;
        Ok::<_, anyhow::Error>(body.len())
    });
    let google = length_task(&bridge, "http://www.google.com", Duration::from_millis(60));
    let total = Task::par(&bing, &google).map("sum", |(b, g)| b + g);

    bridge
        .run_task(&ctx, &total)
        .await
        .map(|total| total.to_string())
        .map_err(internal)
}
