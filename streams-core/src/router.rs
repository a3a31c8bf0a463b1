//! Router is handed to every processor and sink while the graph is built. It is the only way a
//! stage talks to the rest of the graph: forwarding envelopes to its children and marking progress.
//!
//! Forwarding is synchronous within the unit of work. `forward` awaits each child's `process`
//! before returning, there is no queue between stages, and a child's error comes straight back to
//! the caller.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::position::Position;
use crate::stage::Stage;
use crate::tracker::Tracker;

pub(crate) type StageHandle<P> = Arc<Mutex<Stage<P>>>;

/// A wired child of a stage.
pub(crate) struct Downstream<P: Position> {
    pub(crate) name: Arc<str>,
    pub(crate) stage: StageHandle<P>,
}

impl<P: Position> Downstream<P> {
    async fn deliver(&self, envelope: Envelope<P>) -> Result<()> {
        let mut stage = self.stage.lock().await;
        stage.process(envelope).await.map_err(|e| Error::Route {
            stage: self.name.to_string(),
            error: Box::new(e),
        })
    }
}

pub struct Router<P: Position> {
    stage: Arc<str>,
    children: Arc<[Downstream<P>]>,
    tracker: Arc<Tracker<P>>,
}

impl<P: Position> Clone for Router<P> {
    fn clone(&self) -> Self {
        Self {
            stage: Arc::clone(&self.stage),
            children: Arc::clone(&self.children),
            tracker: Arc::clone(&self.tracker),
        }
    }
}

impl<P: Position> Router<P> {
    pub(crate) fn new(
        stage: Arc<str>,
        children: Vec<Downstream<P>>,
        tracker: Arc<Tracker<P>>,
    ) -> Self {
        Self {
            stage,
            children: children.into(),
            tracker,
        }
    }

    /// Name of the stage owning this router.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Names of the wired children, in graph-definition order.
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|c| c.name.as_ref())
    }

    /// Delivers the envelope to every child in graph-definition order. Stops at, and returns, the
    /// first failure.
    pub async fn forward(&self, envelope: Envelope<P>) -> Result<()> {
        let Some((last, rest)) = self.children.split_last() else {
            return Ok(());
        };
        for child in rest {
            child.deliver(envelope.clone()).await?;
        }
        last.deliver(envelope).await
    }

    /// Delivers the envelope only to the named child.
    pub async fn forward_to(&self, child: &str, envelope: Envelope<P>) -> Result<()> {
        let Some(downstream) = self.children.iter().find(|c| c.name.as_ref() == child) else {
            return Err(Error::Graph(format!(
                "stage {} has no child named {child}",
                self.stage
            )));
        };
        downstream.deliver(envelope).await
    }

    /// Merges a Position contribution into the pending commit of the executor. Successive marks of
    /// one stage only move its progress forward.
    pub fn mark(&self, position: P) {
        self.tracker.mark(&self.stage, position);
    }
}
