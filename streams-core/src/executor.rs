//! Executor runs one [Graph] with a single execution loop. A partition parallel deployment runs one
//! Executor per partition, they share nothing.
//!
//! ```text
//!            start()                 close()                    (loop joined, stages closed)
//!   Idle ------------> Running ------------> Draining ---------------------------> Closed
//!     |                                                                              ^
//!     +-------------------------------- close() ------------------------------------+
//! ```
//!
//! The loop pulls one envelope at a time from the sources (round-robin), routes it through the graph
//! and hands pull and route failures to the error handler without stopping. `commit()` and
//! `close()` report their failures to the caller instead.
//!
//! Lock order: the loop locks a source, releases it, then locks stages top-down while routing.
//! Commits lock one stage at a time under the commit lock, so they never wait on each other in a
//! cycle.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::metrics::{error_labels, executor_metrics, stage_labels};
use crate::position::Position;
use crate::router::{Router, StageHandle};

/// Callback receiving the failures of the execution loop.
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    /// close() is stopping the loop and closing the stages.
    Draining,
    Closed,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorState::Idle => write!(f, "idle"),
            ExecutorState::Running => write!(f, "running"),
            ExecutorState::Draining => write!(f, "draining"),
            ExecutorState::Closed => write!(f, "closed"),
        }
    }
}

/// State shared between the Executor handle and its loop task.
struct Shared<P: Position> {
    graph: Graph<P>,
    handler: RwLock<Option<ErrorHandler>>,
    /// serializes caller and loop initiated commits.
    commit_lock: Mutex<()>,
}

impl<P: Position> Shared<P> {
    fn report(&self, error: Error) {
        let stage = error.stage().unwrap_or("executor").to_string();
        warn!(%stage, ?error, "Execution loop error");
        executor_metrics()
            .errors
            .get_or_create(&error_labels(&stage, error.kind()))
            .inc();

        // clone the handler out so it runs without holding the lock, it may register a new one.
        let handler = self.handler.read().as_ref().map(Arc::clone);
        match handler {
            Some(handler) => handler(error),
            None => debug!(%stage, "No error handler registered, error dropped"),
        }
    }

    /// Flushes every sink, then acknowledges every source with everything marked so far.
    async fn commit(&self) -> Result<()> {
        let _guard = self.commit_lock.lock().await;

        // sinks mark what they write out while flushing, so flush before taking the pending position.
        for sink in self.graph.sinks() {
            let mut stage = sink.stage.lock().await;
            if let Err(e) = stage.flush().await {
                executor_metrics()
                    .commit_failures
                    .get_or_create(&stage_labels(&sink.name))
                    .inc();
                return Err(Error::Commit {
                    stage: sink.name.to_string(),
                    error: Box::new(e),
                });
            }
        }

        let tracker = self.graph.tracker();
        let taken = tracker.take();
        let pending = taken.merged(tracker.policy());
        for source in self.graph.sources() {
            let mut stage = source.stage.lock().await;
            if let Err(e) = stage.commit(pending.clone()).await {
                executor_metrics()
                    .commit_failures
                    .get_or_create(&stage_labels(&source.name))
                    .inc();
                tracker.restore(taken);
                return Err(Error::Commit {
                    stage: source.name.to_string(),
                    error: Box::new(e),
                });
            }
            executor_metrics()
                .commits
                .get_or_create(&stage_labels(&source.name))
                .inc();
        }
        debug!(position = ?pending, "Committed");
        Ok(())
    }
}

pub struct Executor<P: Position> {
    shared: Arc<Shared<P>>,
    config: ExecutorConfig,
    state: parking_lot::Mutex<ExecutorState>,
    /// serializes commit() and close().
    lifecycle: Mutex<()>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<P: Position> Executor<P> {
    pub fn new(graph: Graph<P>) -> Self {
        Self::with_config(graph, ExecutorConfig::default())
    }

    pub fn with_config(graph: Graph<P>, config: ExecutorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                graph,
                handler: RwLock::new(None),
                commit_lock: Mutex::new(()),
            }),
            config,
            state: parking_lot::Mutex::new(ExecutorState::Idle),
            lifecycle: Mutex::new(()),
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock()
    }

    /// Registers the callback for loop failures, replacing any previous one. Register before
    /// [Executor::start] to see every error, later registration only sees later errors.
    ///
    /// The handler runs on the loop task. To stop on an error, spawn [Executor::close] on a shared
    /// handle from within the handler.
    pub fn on_error(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }

    /// Spawns the execution loop on the current tokio runtime. A no-op when already running.
    /// Fails with [Error::Runtime] when called outside a runtime, the executor stays idle.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ExecutorState::Running => return Ok(()),
            ExecutorState::Draining | ExecutorState::Closed => return Err(Error::Closed),
            ExecutorState::Idle => {}
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("starting the execution loop: {e}")))?;
        let handle = runtime.spawn(run(
            Arc::clone(&self.shared),
            self.config.clone(),
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(handle);
        *state = ExecutorState::Running;
        info!(
            stages = ?self.shared.graph.names().collect::<Vec<_>>(),
            commit_interval = ?self.config.commit_interval,
            "Executor started"
        );
        Ok(())
    }

    /// Flushes the sinks and acknowledges every source with the position merged from all the
    /// contributions marked since the last successful commit. Stops at the first failure, sources
    /// acknowledged before it stay acknowledged and what was pending is kept for the next commit.
    pub async fn commit(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ExecutorState::Closed {
            return Err(Error::Closed);
        }
        self.shared.commit().await.inspect_err(|e| {
            error!(?e, "Commit failed");
        })
    }

    /// Stops the loop and closes every stage, sinks first and sources last. All close failures are
    /// returned together. Closing a closed executor does nothing.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ExecutorState::Closed {
            return Ok(());
        }
        *self.state.lock() = ExecutorState::Draining;
        info!("Stopping execution loop");

        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(?e, "Execution loop did not exit cleanly");
            }
        }

        let result = self.shared.graph.close().await;
        *self.state.lock() = ExecutorState::Closed;
        match &result {
            Ok(()) => info!("Executor closed"),
            Err(e) => error!(?e, "Executor closed with errors"),
        }
        result
    }
}

impl<P: Position> Drop for Executor<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The execution loop: pull, route, report, repeat until cancelled.
async fn run<P: Position>(shared: Arc<Shared<P>>, config: ExecutorConfig, cancel: CancellationToken) {
    let sources: Vec<(Arc<str>, StageHandle<P>, Router<P>)> = shared
        .graph
        .sources()
        .map(|n| (Arc::clone(&n.name), Arc::clone(&n.stage), n.router.clone()))
        .collect();
    let mut last_commit = Instant::now();

    for (name, stage, router) in sources.iter().cycle() {
        let consumed = {
            let mut stage = stage.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = stage.consume() => result,
            }
        };

        match consumed {
            Ok(envelope) if envelope.is_empty() => tokio::task::yield_now().await,
            Ok(envelope) => {
                executor_metrics()
                    .consumed
                    .get_or_create(&stage_labels(name))
                    .inc();
                if let Err(e) = router.forward(envelope).await {
                    shared.report(Error::Route {
                        stage: name.to_string(),
                        error: Box::new(e),
                    });
                    tokio::task::yield_now().await;
                }
            }
            Err(e) => {
                shared.report(Error::Pull {
                    stage: name.to_string(),
                    error: Box::new(e),
                });
                tokio::task::yield_now().await;
            }
        }

        if let Some(interval) = config.commit_interval {
            if last_commit.elapsed() >= interval {
                if let Err(e) = shared.commit().await {
                    shared.report(e);
                }
                last_commit = Instant::now();
            }
        }
    }

    info!("Execution loop stopped");
}
