use async_trait::async_trait;

use super::wired;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::position::{Origin, Position};
use crate::router::Router;
use crate::stage::Sink;

/// Drops every envelope, its position still counts as processed.
pub struct BlackholeSink<P: Position> {
    router: Option<Router<P>>,
}

impl<P: Position> Default for BlackholeSink<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Position> BlackholeSink<P> {
    pub fn new() -> Self {
        Self { router: None }
    }
}

#[async_trait]
impl<P: Position> Sink<P> for BlackholeSink<P> {
    fn with_router(&mut self, router: Router<P>) -> Result<()> {
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, mut envelope: Envelope<P>) -> Result<()> {
        if let Some(position) = envelope.take_position() {
            wired(&self.router)?.mark(position.with_origin(Origin::Processing));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
