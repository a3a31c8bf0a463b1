//! Core of a stream processing runtime: a Source produces envelopes, Processors transform and route
//! them, Sinks write them out, and a per-partition [Executor] runs the pull, route, commit loop.
//!
//! ```text
//!                  +-------------------- Executor ---------------------+
//!                  |                                                   |
//!   consume() ---> | (Source) --> (Processor) --+--> (Sink) --mark--+  |
//!                  |                            |                   |  |
//!                  |                            +--> (Sink) --mark--+  |
//!                  |                                                v  |
//!   commit()  <--- | <------------ merged Position <-------- Tracker    |
//!                  +---------------------------------------------------+
//! ```
//!
//! Progress is tracked with [Position] contributions. Stages mark them through their [Router], the
//! Executor merges them by [Origin] and [MergePolicy] and acknowledges the result on every source
//! when committing.

/// Builtin sources, sinks and processors.
pub mod builtin;

/// Executor and core settings loaded from the environment.
pub mod config;

/// The unit of data flowing through a graph.
pub mod envelope;

pub mod error;

/// Runs a graph and tracks its progress.
pub mod executor;

/// Immutable wiring of stages, built with [GraphBuilder].
pub mod graph;

/// Prometheus metrics of the executors.
pub mod metrics;

/// Progress markers and the merge algorithm.
pub mod position;

/// The handle a stage uses to reach its children.
pub mod router;

/// Stage contracts.
pub mod stage;

mod tracker;

#[cfg(test)]
mod test_utils;

pub use config::{ExecutorConfig, Settings};
pub use envelope::Envelope;
pub use error::{Error, Result, StageError};
pub use executor::{ErrorHandler, Executor, ExecutorState};
pub use graph::{Graph, GraphBuilder};
pub use metrics::encode_metrics;
pub use position::{LogPosition, MergePolicy, Origin, PartitionOffset, Position};
pub use router::Router;
pub use stage::{Processor, Sink, Source, Stage, StageKind};
