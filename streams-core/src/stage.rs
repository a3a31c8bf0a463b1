//! Stages are the processing units composed into a [Graph](crate::graph::Graph). There are three
//! variants, each with its own capability set:
//!
//! ```text
//! (Source) --forward--> (Processor)* --forward--> (Sink)
//!    ^                       |                       |
//!    |                     mark                    mark
//!    |                       v                       v
//!    +------- commit <--- {pending position} <-------+
//! ```
//!
//! A source produces envelopes and acknowledges positions, it never receives envelopes. Processors
//! and sinks receive envelopes and get a [Router] once, while the graph is built. Sinks usually
//! `mark` after a durable write and never forward.

use std::fmt;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::position::Position;
use crate::router::Router;

/// Produces the envelopes entering the graph and acknowledges the merged positions.
#[async_trait]
pub trait Source<P: Position>: Send {
    /// Returns the next envelope. May wait up to an adapter defined timeout, and returns
    /// [Envelope::empty] when nothing is ready.
    async fn consume(&mut self) -> Result<Envelope<P>>;

    /// Acknowledges consumption up to `position`. The position may hold entries of partitions the
    /// source does not own; those must be ignored. `None` means nothing is pending.
    async fn commit(&mut self, position: Option<P>) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Transforms envelopes and forwards the results through its [Router].
#[async_trait]
pub trait Processor<P: Position>: Send {
    /// Called exactly once, while the graph is built.
    fn with_router(&mut self, router: Router<P>) -> Result<()>;

    async fn process(&mut self, envelope: Envelope<P>) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes envelopes out of the graph and reports durable progress with [Router::mark].
#[async_trait]
pub trait Sink<P: Position>: Send {
    /// Called exactly once, while the graph is built.
    fn with_router(&mut self, router: Router<P>) -> Result<()>;

    async fn process(&mut self, envelope: Envelope<P>) -> Result<()>;

    /// Writes out anything buffered. Called by commit before any source is acknowledged.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Source,
    Processor,
    Sink,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Source => write!(f, "source"),
            StageKind::Processor => write!(f, "processor"),
            StageKind::Sink => write!(f, "sink"),
        }
    }
}

/// Closed set of stage variants held by the graph.
pub enum Stage<P: Position> {
    Source(Box<dyn Source<P>>),
    Processor(Box<dyn Processor<P>>),
    Sink(Box<dyn Sink<P>>),
}

impl<P: Position> Stage<P> {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Source(_) => StageKind::Source,
            Stage::Processor(_) => StageKind::Processor,
            Stage::Sink(_) => StageKind::Sink,
        }
    }

    pub(crate) fn with_router(&mut self, router: Router<P>) -> Result<()> {
        match self {
            Stage::Source(_) => Ok(()),
            Stage::Processor(processor) => processor.with_router(router),
            Stage::Sink(sink) => sink.with_router(router),
        }
    }

    pub(crate) async fn process(&mut self, envelope: Envelope<P>) -> Result<()> {
        match self {
            Stage::Source(_) => Err(Error::Graph(
                "a source cannot receive envelopes".to_string(),
            )),
            Stage::Processor(processor) => processor.process(envelope).await,
            Stage::Sink(sink) => sink.process(envelope).await,
        }
    }

    pub(crate) async fn consume(&mut self) -> Result<Envelope<P>> {
        match self {
            Stage::Source(source) => source.consume().await,
            _ => Err(Error::Graph(format!("a {} cannot be consumed", self.kind()))),
        }
    }

    /// Acknowledges a source, other stages have nothing to acknowledge.
    pub(crate) async fn commit(&mut self, position: Option<P>) -> Result<()> {
        match self {
            Stage::Source(source) => source.commit(position).await,
            _ => Ok(()),
        }
    }

    /// Flushes a sink, other stages hold no write buffers.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        match self {
            Stage::Sink(sink) => sink.flush().await,
            _ => Ok(()),
        }
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        match self {
            Stage::Source(source) => source.close().await,
            Stage::Processor(processor) => processor.close().await,
            Stage::Sink(sink) => sink.close().await,
        }
    }
}
