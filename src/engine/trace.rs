//! Execution trace records.
//!
//! Every task owns a trace fragment: a map from node id to a shallow record
//! of one task execution, plus the relationships between those nodes.
//! Composite tasks absorb the fragments of their children once those finish,
//! so the fragment of a root task describes its whole execution plan.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::Serialize;

/// Process-unique identifier of a task, also used as its trace node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a traced task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultType {
    Success,
    Error,
    Unfinished,
}

impl ResultType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultType::Success => "SUCCESS",
            ResultType::Error => "ERROR",
            ResultType::Unfinished => "UNFINISHED",
        }
    }
}

/// Record of a single task execution, without its relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShallowTrace {
    pub id: TaskId,
    pub name: String,
    #[serde(rename = "resultType")]
    pub result: ResultType,
    /// Error message for failed tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "startNanos", skip_serializing_if = "Option::is_none")]
    pub start_nanos: Option<u64>,
    #[serde(rename = "endNanos", skip_serializing_if = "Option::is_none")]
    pub end_nanos: Option<u64>,
}

impl ShallowTrace {
    pub(crate) fn pending(id: TaskId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            result: ResultType::Unfinished,
            value: None,
            start_nanos: None,
            end_nanos: None,
        }
    }

    /// Wall time between start and end, if the task ran to completion.
    pub fn duration_nanos(&self) -> Option<u64> {
        Some(self.end_nanos?.saturating_sub(self.start_nanos?))
    }
}

/// Directed edge between two trace nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "relationship", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceRelationship {
    /// `from` ran `to` as part of its own execution.
    ParentOf { from: TaskId, to: TaskId },
    /// `to` was started with the result of `from`.
    SuccessorOf { from: TaskId, to: TaskId },
}

impl TraceRelationship {
    pub fn endpoints(&self) -> (TaskId, TaskId) {
        match *self {
            TraceRelationship::ParentOf { from, to } => (from, to),
            TraceRelationship::SuccessorOf { from, to } => (from, to),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TraceRelationship::ParentOf { .. } => "parent of",
            TraceRelationship::SuccessorOf { .. } => "successor of",
        }
    }
}

/// A trace fragment, or a merged graph of several of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    traces: BTreeMap<TaskId, ShallowTrace>,
    relationships: HashSet<TraceRelationship>,
}

#[derive(Serialize)]
struct TraceJson<'a> {
    traces: Vec<&'a ShallowTrace>,
    relationships: Vec<&'a TraceRelationship>,
}

impl Trace {
    pub fn new(
        traces: impl IntoIterator<Item = ShallowTrace>,
        relationships: impl IntoIterator<Item = TraceRelationship>,
    ) -> Self {
        Self {
            traces: traces.into_iter().map(|t| (t.id, t)).collect(),
            relationships: relationships.into_iter().collect(),
        }
    }

    pub fn traces(&self) -> impl Iterator<Item = &ShallowTrace> {
        self.traces.values()
    }

    pub fn get(&self, id: TaskId) -> Option<&ShallowTrace> {
        self.traces.get(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.traces.contains_key(&id)
    }

    pub fn relationships(&self) -> &HashSet<TraceRelationship> {
        &self.relationships
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub(crate) fn update(&mut self, id: TaskId, f: impl FnOnce(&mut ShallowTrace)) {
        if let Some(trace) = self.traces.get_mut(&id) {
            f(trace);
        }
    }

    pub(crate) fn relate(&mut self, relationship: TraceRelationship) {
        self.relationships.insert(relationship);
    }

    /// Merges another fragment into this one.
    ///
    /// Records of `other` overwrite records with the same id in `self`,
    /// relationships are unioned.
    pub fn merge(&mut self, other: &Trace) {
        for (id, trace) in &other.traces {
            self.traces.insert(*id, trace.clone());
        }
        self.relationships.extend(other.relationships.iter().copied());
    }

    /// Serializes the trace as `{"traces": [...], "relationships": [...]}`
    /// with both lists in a stable order.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut relationships: Vec<_> = self.relationships.iter().collect();
        relationships.sort();

        serde_json::to_string(&TraceJson {
            traces: self.traces.values().collect(),
            relationships,
        })
    }

    /// Projects the trace onto a graph, one node per record.
    ///
    /// Relationships pointing at ids without a record are skipped.
    pub fn to_graph(&self) -> Graph<&ShallowTrace, TraceRelationship> {
        let mut graph = Graph::new();
        let mut index: BTreeMap<TaskId, NodeIndex> = BTreeMap::new();

        for (id, trace) in &self.traces {
            index.insert(*id, graph.add_node(trace));
        }

        let mut relationships: Vec<_> = self.relationships.iter().copied().collect();
        relationships.sort();

        for relationship in relationships {
            let (from, to) = relationship.endpoints();
            if let (Some(&a), Some(&b)) = (index.get(&from), index.get(&to)) {
                graph.add_edge(a, b, relationship);
            }
        }

        graph
    }
}

/// Current wall clock time in nanoseconds since the Unix epoch.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, name: &str, result: ResultType) -> ShallowTrace {
        ShallowTrace {
            id: TaskId(id),
            name: name.to_string(),
            result,
            value: None,
            start_nanos: Some(10),
            end_nanos: Some(25),
        }
    }

    #[test]
    fn test_merge_overwrites_and_unions() {
        let mut a = Trace::new(
            [record(1, "a", ResultType::Unfinished)],
            [TraceRelationship::ParentOf {
                from: TaskId(1),
                to: TaskId(2),
            }],
        );
        let b = Trace::new(
            [
                record(1, "a", ResultType::Success),
                record(3, "c", ResultType::Error),
            ],
            [TraceRelationship::SuccessorOf {
                from: TaskId(1),
                to: TaskId(3),
            }],
        );

        a.merge(&b);

        assert_eq!(a.len(), 2);
        assert_eq!(a.get(TaskId(1)).unwrap().result, ResultType::Success);
        assert!(a.contains(TaskId(3)));
        assert_eq!(a.relationships().len(), 2);
    }

    #[test]
    fn test_json_shape() {
        let trace = Trace::new(
            [record(7, "hello", ResultType::Success)],
            [TraceRelationship::ParentOf {
                from: TaskId(7),
                to: TaskId(8),
            }],
        );

        let json = trace.to_json().unwrap();
        assert!(json.contains(r#""id":7"#));
        assert!(json.contains(r#""resultType":"SUCCESS""#));
        assert!(json.contains(r#""relationship":"PARENT_OF""#));
        assert!(!json.contains("value"));
    }

    #[test]
    fn test_graph_skips_dangling_edges() {
        let trace = Trace::new(
            [
                record(1, "root", ResultType::Success),
                record(2, "child", ResultType::Success),
            ],
            [
                TraceRelationship::ParentOf {
                    from: TaskId(1),
                    to: TaskId(2),
                },
                TraceRelationship::ParentOf {
                    from: TaskId(1),
                    to: TaskId(99),
                },
            ],
        );

        let graph = trace.to_graph();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_duration() {
        assert_eq!(record(1, "a", ResultType::Success).duration_nanos(), Some(15));
        assert_eq!(ShallowTrace::pending(TaskId(1), "a").duration_nanos(), None);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b > a);
    }
}
