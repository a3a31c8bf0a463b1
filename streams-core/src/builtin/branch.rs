use async_trait::async_trait;
use tracing::debug;

use super::wired;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::position::Position;
use crate::router::Router;
use crate::stage::Processor;

type Predicate<P> = Box<dyn Fn(&Envelope<P>) -> bool + Send + Sync>;

/// Sends each envelope to the first branch whose predicate accepts it. Envelopes no branch accepts
/// are dropped. Every branch must name a child of this stage, checked when the graph is built.
pub struct BranchProcessor<P: Position> {
    branches: Vec<(String, Predicate<P>)>,
    router: Option<Router<P>>,
}

impl<P: Position> Default for BranchProcessor<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Position> BranchProcessor<P> {
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            router: None,
        }
    }

    /// Appends a branch, branches are tried in the order they are added.
    #[must_use]
    pub fn branch(
        mut self,
        child: &str,
        predicate: impl Fn(&Envelope<P>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.branches.push((child.to_string(), Box::new(predicate)));
        self
    }
}

#[async_trait]
impl<P: Position> Processor<P> for BranchProcessor<P> {
    fn with_router(&mut self, router: Router<P>) -> Result<()> {
        for (child, _) in &self.branches {
            if !router.children().any(|c| c == child) {
                return Err(Error::Stage(format!(
                    "branch {child} is not a child of {}",
                    router.stage()
                )));
            }
        }
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, envelope: Envelope<P>) -> Result<()> {
        let router = wired(&self.router)?;
        let matched = self
            .branches
            .iter()
            .find(|(_, predicate)| predicate(&envelope))
            .map(|(child, _)| child.as_str());
        match matched {
            Some(child) => router.forward_to(child, envelope).await,
            None => {
                debug!(stage = router.stage(), "No branch matched, envelope dropped");
                Ok(())
            }
        }
    }
}
