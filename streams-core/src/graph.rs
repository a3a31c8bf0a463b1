//! Graph is the immutable wiring of the stages run by one [Executor](crate::executor::Executor).
//! It is assembled with [GraphBuilder] and frozen by [GraphBuilder::build]: stages live in an arena
//! and edges are index based, nothing is rewired once the executor starts.
//!
//! ```text
//! GraphBuilder::new()
//!     .source("orders", source)
//!     .processor("enrich", enrich, &["orders"])
//!     .sink("warehouse", warehouse, &["enrich"])
//!     .sink("audit", audit, &["enrich"])
//!     .build()?;
//!
//! (orders) --> (enrich) --+--> (warehouse)
//!                         |
//!                         +--> (audit)
//! ```
//!
//! A stage can only name parents that were declared before it, so the declaration order is a
//! topological order and the graph cannot have cycles.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::{Error, Result, StageError};
use crate::position::{MergePolicy, Position};
use crate::router::{Downstream, Router, StageHandle};
use crate::stage::{Processor, Sink, Source, Stage, StageKind};
use crate::tracker::Tracker;

/// A stage of a built graph along with the router wired to its children.
pub(crate) struct Node<P: Position> {
    pub(crate) name: Arc<str>,
    pub(crate) kind: StageKind,
    pub(crate) stage: StageHandle<P>,
    pub(crate) router: Router<P>,
}

pub struct Graph<P: Position> {
    /// nodes in declaration (topological) order.
    nodes: Vec<Node<P>>,
    tracker: Arc<Tracker<P>>,
}

impl<P: Position> Graph<P> {
    pub fn builder() -> GraphBuilder<P> {
        GraphBuilder::new()
    }

    /// Stage names in topological order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a built graph, it has at least one source.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.tracker.policy()
    }

    pub(crate) fn tracker(&self) -> &Arc<Tracker<P>> {
        &self.tracker
    }

    pub(crate) fn sources(&self) -> impl Iterator<Item = &Node<P>> {
        self.nodes.iter().filter(|n| n.kind == StageKind::Source)
    }

    pub(crate) fn sinks(&self) -> impl Iterator<Item = &Node<P>> {
        self.nodes.iter().filter(|n| n.kind == StageKind::Sink)
    }

    /// Closes every stage, leaves before roots. Keeps going after a failure and returns all of
    /// them combined.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        for node in self.nodes.iter().rev() {
            let mut stage = node.stage.lock().await;
            match stage.close().await {
                Ok(()) => info!(stage = %node.name, kind = %node.kind, "Stage closed"),
                Err(e) => {
                    error!(stage = %node.name, kind = %node.kind, ?e, "Failed to close stage");
                    errors.push(StageError {
                        stage: node.name.to_string(),
                        error: e,
                    });
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(errors))
        }
    }
}

struct PendingNode<P: Position> {
    name: String,
    stage: Stage<P>,
    parents: Vec<String>,
}

/// Collects stages and edges, all validation happens in [GraphBuilder::build].
pub struct GraphBuilder<P: Position> {
    nodes: Vec<PendingNode<P>>,
    merge_policy: MergePolicy,
}

impl<P: Position> Default for GraphBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Position> GraphBuilder<P> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            merge_policy: MergePolicy::default(),
        }
    }

    /// Policy used to reconcile same-origin contributions marked by the stages.
    #[must_use]
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    #[must_use]
    pub fn source(self, name: &str, source: impl Source<P> + 'static) -> Self {
        self.stage(name, Stage::Source(Box::new(source)), &[])
    }

    #[must_use]
    pub fn processor(
        self,
        name: &str,
        processor: impl Processor<P> + 'static,
        parents: &[&str],
    ) -> Self {
        self.stage(name, Stage::Processor(Box::new(processor)), parents)
    }

    #[must_use]
    pub fn sink(self, name: &str, sink: impl Sink<P> + 'static, parents: &[&str]) -> Self {
        self.stage(name, Stage::Sink(Box::new(sink)), parents)
    }

    /// Adds an already boxed stage.
    #[must_use]
    pub fn stage(mut self, name: &str, stage: Stage<P>, parents: &[&str]) -> Self {
        self.nodes.push(PendingNode {
            name: name.to_string(),
            stage,
            parents: parents.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    /// Validates the wiring, hands every processor and sink its router, and freezes the graph.
    pub fn build(self) -> Result<Graph<P>> {
        let children = self.validate()?;
        let tracker = Arc::new(Tracker::new(self.merge_policy));

        // children are always declared after their parents, so walking backwards every child
        // handle exists before its parent's router is built.
        let mut handles: Vec<Option<(Arc<str>, StageHandle<P>)>> =
            self.nodes.iter().map(|_| None).collect();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for ((idx, pending), child_idxs) in self.nodes.into_iter().enumerate().zip(children).rev() {
            let name: Arc<str> = Arc::from(pending.name);
            let mut downstream = Vec::with_capacity(child_idxs.len());
            for child in child_idxs {
                let Some(Some((child_name, stage))) = handles.get(child) else {
                    return Err(Error::Graph(format!(
                        "child {child} of {name} is not built yet"
                    )));
                };
                downstream.push(Downstream {
                    name: Arc::clone(child_name),
                    stage: Arc::clone(stage),
                });
            }

            let router = Router::new(Arc::clone(&name), downstream, Arc::clone(&tracker));
            let mut stage = pending.stage;
            stage
                .with_router(router.clone())
                .map_err(|e| Error::Graph(format!("wiring router of stage {name}: {e}")))?;

            let kind = stage.kind();
            let handle = Arc::new(Mutex::new(stage));
            if let Some(slot) = handles.get_mut(idx) {
                *slot = Some((Arc::clone(&name), Arc::clone(&handle)));
            }
            nodes.push(Node {
                name,
                kind,
                stage: handle,
                router,
            });
        }
        nodes.reverse();

        info!(
            stages = ?nodes.iter().map(|n| n.name.as_ref()).collect::<Vec<_>>(),
            merge_policy = %self.merge_policy,
            "Graph built"
        );

        Ok(Graph { nodes, tracker })
    }

    /// Checks the wiring and returns, per node, the indexes of its children in declaration order.
    fn validate(&self) -> Result<Vec<Vec<usize>>> {
        if !self.nodes.iter().any(|n| n.stage.kind() == StageKind::Source) {
            return Err(Error::Graph("graph has no source".to_string()));
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (idx, node) in self.nodes.iter().enumerate() {
            let kind = node.stage.kind();
            if index.contains_key(node.name.as_str()) {
                return Err(Error::Graph(format!("duplicate stage name {}", node.name)));
            }
            if kind == StageKind::Source && !node.parents.is_empty() {
                return Err(Error::Graph(format!(
                    "source {} cannot have parents",
                    node.name
                )));
            }
            if kind != StageKind::Source && node.parents.is_empty() {
                return Err(Error::Graph(format!("{kind} {} has no parent", node.name)));
            }

            for (i, parent) in node.parents.iter().enumerate() {
                if node.parents.iter().take(i).any(|p| p == parent) {
                    return Err(Error::Graph(format!(
                        "parent {parent} listed twice for {}",
                        node.name
                    )));
                }
                let Some(&parent_idx) = index.get(parent.as_str()) else {
                    return Err(Error::Graph(format!(
                        "unknown parent {parent} for {}, parents must be declared first",
                        node.name
                    )));
                };
                let parent_kind = self
                    .nodes
                    .get(parent_idx)
                    .map(|p| p.stage.kind())
                    .unwrap_or(StageKind::Sink);
                if parent_kind == StageKind::Sink {
                    return Err(Error::Graph(format!(
                        "sink {parent} cannot have children ({})",
                        node.name
                    )));
                }
                if let Some(list) = children.get_mut(parent_idx) {
                    list.push(idx);
                }
            }
            index.insert(node.name.as_str(), idx);
        }

        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::position::{LogPosition, Origin};
    use crate::test_utils::{
        Journal, RecordingProcessor, RecordingSink, RouterlessProcessor, ScriptedSource,
    };

    fn node<'a>(graph: &'a Graph<LogPosition>, name: &str) -> &'a Node<LogPosition> {
        graph
            .nodes
            .iter()
            .find(|n| n.name.as_ref() == name)
            .expect("node should exist")
    }

    fn fan_out(journal: &Journal) -> Graph<LogPosition> {
        let (src, _) = ScriptedSource::new("src", journal);
        let (processor, _) = RecordingProcessor::new("proc", journal);
        let (left, _) = RecordingSink::new("left", journal);
        let (right, _) = RecordingSink::new("right", journal);
        GraphBuilder::new()
            .source("src", src)
            .processor("proc", processor, &["src"])
            .sink("left", left, &["proc"])
            .sink("right", right, &["proc"])
            .build()
            .expect("graph should build")
    }

    #[test]
    fn test_build_wires_every_router_once() {
        let journal = Journal::default();
        let graph = fan_out(&journal);

        assert_eq!(
            graph.names().collect::<Vec<_>>(),
            vec!["src", "proc", "left", "right"]
        );
        assert_eq!(journal.count("with_router:proc"), 1);
        assert_eq!(journal.count("with_router:left"), 1);
        assert_eq!(journal.count("with_router:right"), 1);
        assert_eq!(
            node(&graph, "proc").router.children().collect::<Vec<_>>(),
            vec!["left", "right"]
        );
        assert_eq!(node(&graph, "src").router.children().count(), 1);
        assert_eq!(graph.sources().count(), 1);
        assert_eq!(graph.sinks().count(), 2);
    }

    #[test]
    fn test_build_rejects_invalid_wiring() {
        let journal = Journal::default();
        let cases: Vec<(&str, GraphBuilder<LogPosition>)> = vec![
            ("graph has no source", {
                let (sink, _) = RecordingSink::new("sink", &journal);
                GraphBuilder::new().sink("sink", sink, &[])
            }),
            ("duplicate stage name src", {
                let (a, _) = ScriptedSource::new("src", &journal);
                let (b, _) = ScriptedSource::new("src", &journal);
                GraphBuilder::new().source("src", a).source("src", b)
            }),
            ("unknown parent missing", {
                let (src, _) = ScriptedSource::new("src", &journal);
                let (sink, _) = RecordingSink::new("sink", &journal);
                GraphBuilder::new()
                    .source("src", src)
                    .sink("sink", sink, &["missing"])
            }),
            ("processor proc has no parent", {
                let (src, _) = ScriptedSource::new("src", &journal);
                let (processor, _) = RecordingProcessor::new("proc", &journal);
                GraphBuilder::new()
                    .source("src", src)
                    .processor("proc", processor, &[])
            }),
            ("sink sink cannot have children", {
                let (src, _) = ScriptedSource::new("src", &journal);
                let (sink, _) = RecordingSink::new("sink", &journal);
                let (processor, _) = RecordingProcessor::new("proc", &journal);
                GraphBuilder::new()
                    .source("src", src)
                    .sink("sink", sink, &["src"])
                    .processor("proc", processor, &["sink"])
            }),
            ("source second cannot have parents", {
                let (first, _) = ScriptedSource::new("first", &journal);
                let (second, _) = ScriptedSource::new("second", &journal);
                GraphBuilder::new()
                    .source("first", first)
                    .stage("second", Stage::Source(Box::new(second)), &["first"])
            }),
            ("parent src listed twice", {
                let (src, _) = ScriptedSource::new("src", &journal);
                let (sink, _) = RecordingSink::new("sink", &journal);
                GraphBuilder::new()
                    .source("src", src)
                    .sink("sink", sink, &["src", "src"])
            }),
            ("wiring router of stage proc", {
                let (src, _) = ScriptedSource::new("src", &journal);
                GraphBuilder::new()
                    .source("src", src)
                    .processor("proc", RouterlessProcessor, &["src"])
            }),
        ];

        for (expected, builder) in cases {
            match builder.build() {
                Err(Error::Graph(msg)) => assert!(
                    msg.contains(expected),
                    "expected {expected:?} in {msg:?}"
                ),
                Err(e) => panic!("expected graph error for {expected:?}, got {e:?}"),
                Ok(_) => panic!("expected {expected:?} to fail"),
            }
        }
    }

    #[test]
    fn test_parent_declared_later_is_unknown() {
        let journal = Journal::default();
        let (src, _) = ScriptedSource::new("src", &journal);
        let (processor, _) = RecordingProcessor::new("proc", &journal);
        let (sink, _) = RecordingSink::new("sink", &journal);

        let result = GraphBuilder::new()
            .source("src", src)
            .sink("sink", sink, &["proc"])
            .processor("proc", processor, &["src"])
            .build();

        assert!(matches!(result, Err(Error::Graph(msg)) if msg.contains("unknown parent proc")));
    }

    #[test]
    fn test_merge_policy_is_carried() {
        let journal = Journal::default();
        let (src, _) = ScriptedSource::new("src", &journal);
        let graph: Graph<LogPosition> = Graph::builder()
            .merge_policy(MergePolicy::DuplicateAverse)
            .source("src", src)
            .build()
            .unwrap();

        assert_eq!(graph.merge_policy(), MergePolicy::DuplicateAverse);
        assert_eq!(graph.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_reaches_children_in_order() {
        let journal = Journal::default();
        let graph = fan_out(&journal);

        let router = node(&graph, "src").router.clone();
        router
            .forward(Envelope::new("k", "v"))
            .await
            .expect("forward should succeed");

        assert_eq!(
            journal
                .events()
                .into_iter()
                .filter(|e| e.starts_with("process:"))
                .collect::<Vec<_>>(),
            vec!["process:proc", "process:left", "process:right"]
        );
    }

    #[tokio::test]
    async fn test_forward_to_named_child() {
        let journal = Journal::default();
        let graph = fan_out(&journal);
        let router = node(&graph, "proc").router.clone();

        router
            .forward_to("right", Envelope::new("k", "v"))
            .await
            .unwrap();
        assert_eq!(journal.count("process:right"), 1);
        assert_eq!(journal.count("process:left"), 0);

        let err = router
            .forward_to("middle", Envelope::new("k", "v"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Graph(msg) if msg == "stage proc has no child named middle"));
    }

    #[tokio::test]
    async fn test_forward_without_children_is_noop() {
        let journal = Journal::default();
        let graph = fan_out(&journal);

        node(&graph, "left")
            .router
            .forward(Envelope::new("k", "v"))
            .await
            .unwrap();
        assert_eq!(journal.count("process:left"), 0);
    }

    #[tokio::test]
    async fn test_child_failure_is_wrapped_with_path() {
        let journal = Journal::default();
        let (src, _) = ScriptedSource::new("src", &journal);
        let (processor, _) = RecordingProcessor::new("proc", &journal);
        let (sink, sink_tally) = RecordingSink::new("sink", &journal);
        let graph = GraphBuilder::new()
            .source("src", src)
            .processor("proc", processor, &["src"])
            .sink("sink", sink, &["proc"])
            .build()
            .unwrap();
        sink_tally.faults.fail_processes(1);

        let err = node(&graph, "src")
            .router
            .forward(Envelope::new("k", "v"))
            .await
            .unwrap_err();

        let Error::Route { stage, error } = err else {
            panic!("expected route error");
        };
        assert_eq!(stage, "proc");
        assert!(matches!(*error, Error::Route { ref stage, .. } if stage == "sink"));
    }

    #[tokio::test]
    async fn test_mark_reaches_shared_tracker() {
        let journal = Journal::default();
        let graph = fan_out(&journal);

        node(&graph, "left")
            .router
            .mark(LogPosition::single("p", 0, 3, Origin::Processing));
        node(&graph, "right")
            .router
            .mark(LogPosition::single("p", 1, 2, Origin::Processing));

        let pending = graph.tracker().pending().unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_close_runs_leaves_first_and_combines_errors() {
        let journal = Journal::default();
        let (src, src_tally) = ScriptedSource::new("src", &journal);
        let (processor, proc_tally) = RecordingProcessor::new("proc", &journal);
        let (sink, _) = RecordingSink::new("sink", &journal);
        let graph = GraphBuilder::new()
            .source("src", src)
            .processor("proc", processor, &["src"])
            .sink("sink", sink, &["proc"])
            .build()
            .unwrap();
        src_tally.faults.fail_closes(1);
        proc_tally.faults.fail_closes(1);

        let err = graph.close().await.unwrap_err();

        assert_eq!(
            journal
                .events()
                .into_iter()
                .filter(|e| e.starts_with("close:"))
                .collect::<Vec<_>>(),
            vec!["close:sink", "close:proc", "close:src"]
        );
        let Error::Close(errors) = err else {
            panic!("expected close error");
        };
        assert_eq!(
            errors.iter().map(|e| e.stage.as_str()).collect::<Vec<_>>(),
            vec!["proc", "src"]
        );
    }
}
