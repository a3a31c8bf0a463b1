//! Tracker accumulates the Position contributions marked by the stages of one graph since the last
//! successful commit. Every [Router](crate::router::Router) of the graph shares the same Tracker,
//! and the executor drains it when it commits.
//!
//! Progress is kept per marking stage. A stage's successive marks only move forward
//! ([MergePolicy::DuplicateAverse]), the graph policy reconciles the stages with each other when
//! the pending Position is taken.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::position::{self, MergePolicy, Position};

/// Per stage Positions, in the order the stages first marked.
#[derive(Debug, Clone)]
pub(crate) struct Pending<P> {
    stages: Vec<(Arc<str>, P)>,
}

impl<P> Default for Pending<P> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<P: Position> Pending<P> {
    fn mark(&mut self, stage: &Arc<str>, position: P) {
        match self.stages.iter_mut().find(|(name, _)| name == stage) {
            Some((_, current)) => {
                *current = position.merge(Some(&*current), MergePolicy::DuplicateAverse);
            }
            None => self.stages.push((Arc::clone(stage), position)),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Folds the stage Positions into the one Position handed to the sources.
    pub(crate) fn merged(&self, policy: MergePolicy) -> Option<P> {
        self.stages
            .iter()
            .fold(None, |acc, (_, position)| {
                position::merge(Some(position), acc.as_ref(), policy)
            })
    }
}

#[derive(Debug)]
pub(crate) struct Tracker<P> {
    policy: MergePolicy,
    pending: Mutex<Pending<P>>,
}

impl<P: Position> Tracker<P> {
    pub(crate) fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub(crate) fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Merges a contribution of `stage` over what that stage marked before.
    pub(crate) fn mark(&self, stage: &Arc<str>, position: P) {
        self.pending.lock().mark(stage, position);
    }

    /// Takes the pending Positions, leaving nothing pending.
    pub(crate) fn take(&self) -> Pending<P> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Puts back Positions taken for a commit that failed. Contributions marked in the meantime
    /// are newer and are merged over them, stage by stage.
    pub(crate) fn restore(&self, taken: Pending<P>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::replace(&mut *pending, taken);
        for (stage, position) in newer.stages {
            pending.mark(&stage, position);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> Option<P> {
        self.pending.lock().merged(self.policy)
    }
}
