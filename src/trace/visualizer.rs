use std::fmt::{Display, Formatter, Write};

use crate::core::Environment;
use crate::engine::{ResultType, ShallowTrace, Trace, TraceRelationship};
use crate::trace::renderer::TraceVisualizer;

/// Default trace page: the raw trace as JSON, a Mermaid graph of the task
/// relationships and an SVG waterfall of task timings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceView;

impl TraceVisualizer for TraceView {
    fn show(&self, trace: &Trace, environment: &Environment) -> Option<String> {
        if trace.is_empty() {
            return None;
        }

        let json = trace.to_json().ok()?;
        let mut html = String::with_capacity(4096 + trace.len() * 600);

        write_page(&mut html, trace, environment, &json).ok()?;
        Some(html)
    }
}

const MERMAID: &str = "https://cdn.jsdelivr.net/npm/mermaid@11/dist/mermaid.esm.min.mjs";

const PAGE_CSS: &str = r#"
    body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif; margin: 2rem; color: #111; }
    h1 { font-size: 1.4rem; }
    h2 { font-size: 1.1rem; margin-top: 2rem; }
    section { overflow-x: auto; }
    a { color: #2563eb; }"#;

fn write_page(
    buf: &mut String,
    trace: &Trace,
    environment: &Environment,
    json: &str,
) -> std::fmt::Result {
    let title = XmlSafe(environment.application);

    write!(
        buf,
        r#"<!DOCTYPE html><html><head><meta charset="utf-8"><title>Trace · {title}</title><style>{PAGE_CSS}</style></head><body>"#
    )?;
    write!(
        buf,
        r#"<h1>Trace of {count} tasks</h1><p><a href="{home}">{title}</a></p>"#,
        count = trace.len(),
        home = XmlSafe(&environment.context_path),
    )?;

    buf.push_str("<h2>Timeline</h2><section>");
    write_waterfall(buf, trace)?;
    buf.push_str("</section>");

    buf.push_str(r#"<h2>Graph</h2><section><pre class="mermaid">"#);
    write_mermaid(buf, trace)?;
    buf.push_str("</pre></section>");

    write!(
        buf,
        r#"<script type="application/json" id="trace-data">{}</script>"#,
        ScriptSafe(json)
    )?;
    write!(
        buf,
        r#"<script type="module">import mermaid from "{MERMAID}"; mermaid.initialize({{ startOnLoad: true }});</script>"#
    )?;

    buf.push_str("</body></html>");
    Ok(())
}

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

/// JSON embedded in a `<script>` element, with `<` escaped so the payload
/// can never close the element.
struct ScriptSafe<'a>(&'a str);

impl Display for ScriptSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, part) in self.0.split('<').enumerate() {
            if i > 0 {
                f.write_str("\\u003c")?;
            }
            f.write_str(part)?;
        }
        Ok(())
    }
}

// MERMAID

fn write_mermaid(buf: &mut String, trace: &Trace) -> std::fmt::Result {
    let graph = trace.to_graph();
    let range = DurationRange::of(trace.traces());

    writeln!(buf, "graph LR")?;

    for index in graph.node_indices() {
        let node = graph[index];
        let name = XmlSafe(&node.name);

        let (label, color) = match (node.result, node.duration_nanos()) {
            (ResultType::Error, _) => ("failed".to_string(), String::from("#FCA5A5")),
            (ResultType::Unfinished, _) | (_, None) => {
                ("unfinished".to_string(), String::from("#D1D5DB"))
            }
            (ResultType::Success, Some(nanos)) => (format_nanos(nanos), range.color(nanos)),
        };

        writeln!(buf, "    t{}[\"{}\\n{}\"]", node.id, name, label)?;
        writeln!(buf, "    style t{} fill:{}", node.id, color)?;
    }

    for edge in graph.edge_indices() {
        let Some((source, target)) = graph.edge_endpoints(edge) else {
            continue;
        };
        let relationship = graph[edge];
        let arrow = match relationship {
            TraceRelationship::ParentOf { .. } => "-->",
            TraceRelationship::SuccessorOf { .. } => "-.->",
        };

        writeln!(
            buf,
            "    t{} {} |{}| t{}",
            graph[source].id,
            arrow,
            relationship.label(),
            graph[target].id
        )?;
    }

    Ok(())
}

/// Spread of finished task durations, used to color nodes from green (fast)
/// through yellow to red (slow).
struct DurationRange {
    min: f64,
    max: f64,
}

impl DurationRange {
    fn of<'a>(traces: impl Iterator<Item = &'a ShallowTrace>) -> Self {
        let mut min = f64::MAX;
        let mut max = f64::MIN;

        for nanos in traces.filter_map(ShallowTrace::duration_nanos) {
            let nanos = nanos as f64;
            min = min.min(nanos);
            max = max.max(nanos);
        }

        if min > max {
            min = 0.0;
            max = 0.0;
        }

        if (max - min).abs() < f64::EPSILON {
            max = min + 1.0;
        }

        Self { min, max }
    }

    fn color(&self, nanos: u64) -> String {
        let t = ((nanos as f64 - self.min) / (self.max - self.min)).clamp(0.0, 1.0);

        let (r, g) = if t < 0.5 {
            ((255.0 * t * 2.0) as u8, 255)
        } else {
            (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
        };

        format!("#{:02X}{:02X}00", r, g)
    }
}

// WATERFALL

#[derive(Debug, Clone, Copy)]
struct WaterfallLayout {
    row_height: u32,
    label_width: u32,
    chart_width: u32,
    padding: u32,
    header_height: u32,
    text_space: u32,
}

impl Default for WaterfallLayout {
    fn default() -> Self {
        Self {
            row_height: 26,
            label_width: 260,
            chart_width: 800,
            padding: 10,
            header_height: 30,
            text_space: 80,
        }
    }
}

impl WaterfallLayout {
    fn total_width(&self) -> u32 {
        self.label_width + self.chart_width + (self.padding * 3) + self.text_space
    }

    fn total_height(&self, rows: usize) -> u32 {
        self.header_height + (rows as u32 * self.row_height) + self.padding
    }
}

/// One bar of the waterfall. Unfinished tasks end where they started.
struct Row<'a> {
    trace: &'a ShallowTrace,
    start: u64,
    end: u64,
}

struct Timeline {
    origin: u64,
    total: f64,
}

impl Timeline {
    fn of(rows: &[Row<'_>]) -> Option<Self> {
        let origin = rows.iter().map(|r| r.start).min()?;
        let end = rows.iter().map(|r| r.end).max()?;

        Some(Self {
            origin,
            total: end.saturating_sub(origin).max(1) as f64,
        })
    }
}

fn format_nanos(nanos: u64) -> String {
    let micros = nanos as f64 / 1000.0;
    if micros < 1000.0 {
        format!("{:.0}µs", micros)
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

fn write_waterfall(buf: &mut String, trace: &Trace) -> std::fmt::Result {
    let mut rows: Vec<Row> = trace
        .traces()
        .filter_map(|trace| {
            let start = trace.start_nanos?;
            let end = trace.end_nanos.unwrap_or(start).max(start);
            Some(Row { trace, start, end })
        })
        .collect();

    let Some(timeline) = Timeline::of(&rows) else {
        buf.push_str(r#"<p>No task was started.</p>"#);
        return Ok(());
    };

    rows.sort_by_key(|row| (row.start, row.trace.id));

    let layout = WaterfallLayout::default();
    let css = r#"
        .row:nth-child(even) { fill: #f9f9f9; }
        .row:nth-child(odd) { fill: #ffffff; }
        text { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif; font-size: 12px; }
        .SUCCESS { fill: #3b82f6; }
        .ERROR { fill: #ef4444; }
        .UNFINISHED { fill: #9ca3af; }
        .label { fill: #333; }
        .time { fill: #666; font-size: 11px; }
        .grid-line { stroke: #e5e7eb; stroke-width: 1; }
        .axis-label { fill: #9ca3af; font-size: 10px; }"#;

    write!(
        buf,
        r#"<svg width="{}" height="{}" xmlns="http://www.w3.org/2000/svg"><style>{}</style><rect width="100%" height="100%" fill="white" />"#,
        layout.total_width(),
        layout.total_height(rows.len()),
        css
    )?;

    let steps = 5;
    for i in 0..=steps {
        let pct = i as f64 / steps as f64;
        let x = layout.label_width as f64
            + layout.padding as f64
            + (layout.chart_width as f64 * pct);

        write!(
            buf,
            r#"<line x1="{x:.1}" y1="{y1}" x2="{x:.1}" y2="100%" class="grid-line" /><text x="{x:.1}" y="{y_text}" text-anchor="middle" class="axis-label">{label}</text>"#,
            y1 = layout.header_height,
            y_text = layout.header_height - 5,
            label = format_nanos((timeline.total * pct) as u64),
        )?;
    }

    for (i, row) in rows.iter().enumerate() {
        let name = XmlSafe(&row.trace.name);
        let y = layout.header_height + (i as u32 * layout.row_height);
        let y_center = y + (layout.row_height / 2);
        let duration = row.end - row.start;

        write!(
            buf,
            r#"<rect x="0" y="{y}" width="100%" height="{h}" class="row" /><text x="{x}" y="{y_center}" class="label" dominant-baseline="middle">{name} #{id}</text>"#,
            h = layout.row_height,
            x = layout.padding,
            id = row.trace.id,
        )?;

        let offset = (row.start - timeline.origin) as f64;
        let bar_x = layout.label_width as f64
            + layout.padding as f64
            + (offset / timeline.total * layout.chart_width as f64);
        let bar_w = (duration as f64 / timeline.total * layout.chart_width as f64).max(1.0);
        let result = row.trace.result.as_str();

        write!(
            buf,
            r#"<rect x="{bar_x:.1}" y="{y}" width="{bar_w:.1}" height="{h}" rx="4" class="{result}"><title>{name}: {result}</title></rect>"#,
            y = y + 5,
            h = layout.row_height - 10,
        )?;
        write!(
            buf,
            r#"<text x="{x:.1}" y="{y_center}" class="time" dominant-baseline="middle">{text}</text>"#,
            x = bar_x + bar_w + 5.0,
            text = format_nanos(duration),
        )?;
    }

    buf.push_str("</svg>");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Mode;
    use crate::engine::TaskId;

    fn record(
        id: u64,
        name: &str,
        result: ResultType,
        span: Option<(u64, u64)>,
    ) -> ShallowTrace {
        ShallowTrace {
            id: TaskId(id),
            name: name.to_string(),
            result,
            value: None,
            start_nanos: span.map(|s| s.0),
            end_nanos: span.map(|s| s.1),
        }
    }

    fn sample() -> Trace {
        Trace::new(
            [
                record(1, "par2", ResultType::Success, Some((0, 3_000_000))),
                record(2, "five", ResultType::Success, Some((10, 1_000))),
                record(3, "<seven>", ResultType::Error, Some((20, 2_000_000))),
                record(4, "never", ResultType::Unfinished, None),
            ],
            [
                TraceRelationship::ParentOf {
                    from: TaskId(1),
                    to: TaskId(2),
                },
                TraceRelationship::SuccessorOf {
                    from: TaskId(2),
                    to: TaskId(3),
                },
            ],
        )
    }

    #[test]
    fn test_empty_trace_is_not_shown() {
        let env = Environment::new(Mode::Dev);
        assert!(TraceView.show(&Trace::default(), &env).is_none());
    }

    #[test]
    fn test_page_contents() {
        let env = Environment::new(Mode::Dev).with_context_path("app");
        let html = TraceView.show(&sample(), &env).unwrap();

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("Trace of 4 tasks"));
        assert!(html.contains(r#"href="/app""#));
        assert!(html.contains(r#"id="trace-data""#));
        assert!(html.contains("t1 --> |parent of| t2"));
        assert!(html.contains("t2 -.-> |successor of| t3"));
        assert!(html.contains("&lt;seven&gt;"));
        assert!(!html.contains("<seven>"));
        assert!(html.contains("<svg"));
    }

    #[test]
    fn test_waterfall_skips_unstarted() {
        let mut svg = String::new();
        write_waterfall(&mut svg, &sample()).unwrap();

        assert_eq!(svg.matches("class=\"row\"").count(), 3);
        assert!(svg.contains("class=\"ERROR\""));
        assert!(!svg.contains("never"));
    }

    #[test]
    fn test_script_is_not_closed_early() {
        assert_eq!(
            ScriptSafe(r#"{"v":"</script>"}"#).to_string(),
            r#"{"v":"\u003c/script>"}"#
        );
    }

    #[test]
    fn test_duration_colors() {
        let range = DurationRange { min: 0.0, max: 100.0 };
        assert_eq!(range.color(0), "#00FF00");
        assert_eq!(range.color(100), "#FF0000");
    }
}
