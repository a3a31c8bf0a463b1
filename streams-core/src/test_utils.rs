//! Recording stage doubles shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::position::LogPosition;
use crate::router::Router;
use crate::stage::{Processor, Sink, Source};

/// Ordered log of stage calls (`"close:sink"`, `"flush:sink"`, ...) shared by every double of a graph.
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn record(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }
}

/// Fails the next N calls of an operation.
#[derive(Debug, Default)]
pub(crate) struct Faults {
    consumes: AtomicUsize,
    processes: AtomicUsize,
    flushes: AtomicUsize,
    commits: AtomicUsize,
    closes: AtomicUsize,
}

impl Faults {
    pub(crate) fn fail_consumes(&self, count: usize) {
        self.consumes.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_processes(&self, count: usize) {
        self.processes.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_flushes(&self, count: usize) {
        self.flushes.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_commits(&self, count: usize) {
        self.commits.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_closes(&self, count: usize) {
        self.closes.store(count, Ordering::Relaxed);
    }

    fn check(counter: &AtomicUsize, what: &str) -> Result<()> {
        let failed = counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok();
        if failed {
            Err(Error::Stage(format!("injected {what} failure")))
        } else {
            Ok(())
        }
    }
}

/// Everything a double observed, readable after the double moved into the graph.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub(crate) faults: Faults,
    received: Mutex<Vec<Bytes>>,
    commits: Mutex<Vec<Option<LogPosition>>>,
}

impl Tally {
    pub(crate) fn received(&self) -> Vec<Bytes> {
        self.received.lock().clone()
    }

    pub(crate) fn commits(&self) -> Vec<Option<LogPosition>> {
        self.commits.lock().clone()
    }
}

/// Source replaying a fixed list of envelopes, then returning empty envelopes.
pub(crate) struct ScriptedSource {
    name: String,
    pending: VecDeque<Envelope<LogPosition>>,
    tally: Arc<Tally>,
    journal: Journal,
}

impl ScriptedSource {
    pub(crate) fn new(name: &str, journal: &Journal) -> (Self, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        (
            Self {
                name: name.to_string(),
                pending: VecDeque::new(),
                tally: Arc::clone(&tally),
                journal: journal.clone(),
            },
            tally,
        )
    }

    pub(crate) fn with_envelopes(
        mut self,
        envelopes: impl IntoIterator<Item = Envelope<LogPosition>>,
    ) -> Self {
        self.pending.extend(envelopes);
        self
    }
}

#[async_trait]
impl Source<LogPosition> for ScriptedSource {
    async fn consume(&mut self) -> Result<Envelope<LogPosition>> {
        Faults::check(&self.tally.faults.consumes, "consume")?;
        match self.pending.pop_front() {
            Some(envelope) => Ok(envelope),
            None => {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(Envelope::empty())
            }
        }
    }

    async fn commit(&mut self, position: Option<LogPosition>) -> Result<()> {
        self.journal.record(format!("commit:{}", self.name));
        Faults::check(&self.tally.faults.commits, "commit")?;
        self.tally.commits.lock().push(position);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.journal.record(format!("close:{}", self.name));
        Faults::check(&self.tally.faults.closes, "close")
    }
}

/// Processor recording the values it sees, optionally marking a fixed position, then forwarding.
pub(crate) struct RecordingProcessor {
    name: String,
    router: Option<Router<LogPosition>>,
    mark: Option<LogPosition>,
    tally: Arc<Tally>,
    journal: Journal,
}

impl RecordingProcessor {
    pub(crate) fn new(name: &str, journal: &Journal) -> (Self, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        (
            Self {
                name: name.to_string(),
                router: None,
                mark: None,
                tally: Arc::clone(&tally),
                journal: journal.clone(),
            },
            tally,
        )
    }

    pub(crate) fn marking(mut self, position: LogPosition) -> Self {
        self.mark = Some(position);
        self
    }
}

#[async_trait]
impl Processor<LogPosition> for RecordingProcessor {
    fn with_router(&mut self, router: Router<LogPosition>) -> Result<()> {
        self.journal.record(format!("with_router:{}", self.name));
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, envelope: Envelope<LogPosition>) -> Result<()> {
        self.journal.record(format!("process:{}", self.name));
        if let Some(value) = envelope.value.clone() {
            self.tally.received.lock().push(value);
        }
        Faults::check(&self.tally.faults.processes, "process")?;
        let Some(router) = &self.router else {
            return Err(Error::Stage("router is not set".to_string()));
        };
        if let Some(position) = &self.mark {
            router.mark(position.clone());
        }
        router.forward(envelope).await
    }

    async fn close(&mut self) -> Result<()> {
        self.journal.record(format!("close:{}", self.name));
        Faults::check(&self.tally.faults.closes, "close")
    }
}

/// Sink recording the values it sees and marking the attached position as written.
pub(crate) struct RecordingSink {
    name: String,
    router: Option<Router<LogPosition>>,
    tally: Arc<Tally>,
    journal: Journal,
}

impl RecordingSink {
    pub(crate) fn new(name: &str, journal: &Journal) -> (Self, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        (
            Self {
                name: name.to_string(),
                router: None,
                tally: Arc::clone(&tally),
                journal: journal.clone(),
            },
            tally,
        )
    }
}

#[async_trait]
impl Sink<LogPosition> for RecordingSink {
    fn with_router(&mut self, router: Router<LogPosition>) -> Result<()> {
        self.journal.record(format!("with_router:{}", self.name));
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, mut envelope: Envelope<LogPosition>) -> Result<()> {
        self.journal.record(format!("process:{}", self.name));
        if let Some(value) = envelope.value.clone() {
            self.tally.received.lock().push(value);
        }
        Faults::check(&self.tally.faults.processes, "process")?;
        if let (Some(router), Some(position)) = (&self.router, envelope.take_position()) {
            router.mark(position);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.journal.record(format!("flush:{}", self.name));
        Faults::check(&self.tally.faults.flushes, "flush")
    }

    async fn close(&mut self) -> Result<()> {
        self.journal.record(format!("close:{}", self.name));
        Faults::check(&self.tally.faults.closes, "close")
    }
}

/// Processor rejecting the router it is given.
pub(crate) struct RouterlessProcessor;

#[async_trait]
impl Processor<LogPosition> for RouterlessProcessor {
    fn with_router(&mut self, _router: Router<LogPosition>) -> Result<()> {
        Err(Error::Stage("no router wanted".to_string()))
    }

    async fn process(&mut self, _envelope: Envelope<LogPosition>) -> Result<()> {
        Ok(())
    }
}
