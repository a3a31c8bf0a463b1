use async_trait::async_trait;

use super::wired;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::position::Position;
use crate::router::Router;
use crate::stage::Processor;

/// Replaces every envelope with the result of `f` and forwards it to all children.
pub struct MapProcessor<P: Position, F> {
    f: F,
    router: Option<Router<P>>,
}

impl<P, F> MapProcessor<P, F>
where
    P: Position,
    F: Fn(Envelope<P>) -> Result<Envelope<P>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f, router: None }
    }
}

#[async_trait]
impl<P, F> Processor<P> for MapProcessor<P, F>
where
    P: Position,
    F: Fn(Envelope<P>) -> Result<Envelope<P>> + Send,
{
    fn with_router(&mut self, router: Router<P>) -> Result<()> {
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, envelope: Envelope<P>) -> Result<()> {
        let router = wired(&self.router)?;
        let mapped = (self.f)(envelope)?;
        router.forward(mapped).await
    }
}

/// Forwards the envelopes `predicate` accepts, drops the rest.
pub struct FilterProcessor<P: Position, F> {
    predicate: F,
    router: Option<Router<P>>,
}

impl<P, F> FilterProcessor<P, F>
where
    P: Position,
    F: Fn(&Envelope<P>) -> bool + Send,
{
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            router: None,
        }
    }
}

#[async_trait]
impl<P, F> Processor<P> for FilterProcessor<P, F>
where
    P: Position,
    F: Fn(&Envelope<P>) -> bool + Send,
{
    fn with_router(&mut self, router: Router<P>) -> Result<()> {
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, envelope: Envelope<P>) -> Result<()> {
        let router = wired(&self.router)?;
        if (self.predicate)(&envelope) {
            router.forward(envelope).await
        } else {
            Ok(())
        }
    }
}

/// Expands every envelope into zero or more envelopes, forwarded in order. Stops at the first
/// downstream failure.
pub struct FlatMapProcessor<P: Position, F> {
    f: F,
    router: Option<Router<P>>,
}

impl<P, F> FlatMapProcessor<P, F>
where
    P: Position,
    F: Fn(Envelope<P>) -> Result<Vec<Envelope<P>>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f, router: None }
    }
}

#[async_trait]
impl<P, F> Processor<P> for FlatMapProcessor<P, F>
where
    P: Position,
    F: Fn(Envelope<P>) -> Result<Vec<Envelope<P>>> + Send,
{
    fn with_router(&mut self, router: Router<P>) -> Result<()> {
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, envelope: Envelope<P>) -> Result<()> {
        let router = wired(&self.router)?;
        for item in (self.f)(envelope)? {
            router.forward(item).await?;
        }
        Ok(())
    }
}
