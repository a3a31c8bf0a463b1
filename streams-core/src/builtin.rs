//! Builtin stages for wiring graphs without an external system: an in-memory channel source,
//! two sinks and closure based processors.

use crate::error::{Error, Result};
use crate::position::Position;
use crate::router::Router;

/// Blackhole is a sink to emulate /dev/null.
mod blackhole;
/// Routes each envelope to the first branch whose predicate matches.
mod branch;
/// In-memory source fed by a tokio channel.
mod channel;
/// Logs every envelope.
mod log;
/// Map, filter and flat-map processors.
mod transform;

pub use blackhole::BlackholeSink;
pub use branch::BranchProcessor;
pub use channel::ChannelSource;
pub use log::LogSink;
pub use transform::{FilterProcessor, FlatMapProcessor, MapProcessor};

/// Returns the router handed over by the graph, stages only process envelopes once wired.
fn wired<P: Position>(router: &Option<Router<P>>) -> Result<&Router<P>> {
    router
        .as_ref()
        .ok_or_else(|| Error::Stage("stage is not wired into a graph".to_string()))
}
