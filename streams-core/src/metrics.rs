//! Executor metrics, kept in one process wide registry so that every Executor of a partition
//! parallel deployment reports into the same exposition.

use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// The top-level metric registry is created with the REGISTRY_GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "streams";

const STAGE_LABEL: &str = "stage";
const ERROR_KIND_LABEL: &str = "kind";

// counters, the _total suffix is added by the client library.
const CONSUMED_TOTAL: &str = "consumed";
const ERRORS_TOTAL: &str = "errors";
const COMMITS_TOTAL: &str = "commits";
const COMMIT_FAILURES_TOTAL: &str = "commit_failures";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // metrics are registered once, so a blocking mutex is fine.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_GLOBAL_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Counter families of the execution loop and commit path, labelled by stage.
pub(crate) struct ExecutorMetrics {
    pub(crate) consumed: Family<Vec<(String, String)>, Counter>,
    pub(crate) errors: Family<Vec<(String, String)>, Counter>,
    pub(crate) commits: Family<Vec<(String, String)>, Counter>,
    pub(crate) commit_failures: Family<Vec<(String, String)>, Counter>,
}

impl ExecutorMetrics {
    fn new() -> Self {
        let metrics = Self {
            consumed: Family::<Vec<(String, String)>, Counter>::default(),
            errors: Family::<Vec<(String, String)>, Counter>::default(),
            commits: Family::<Vec<(String, String)>, Counter>::default(),
            commit_failures: Family::<Vec<(String, String)>, Counter>::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            CONSUMED_TOTAL,
            "Total number of envelopes consumed from a source",
            metrics.consumed.clone(),
        );
        registry.register(
            ERRORS_TOTAL,
            "Total number of errors reported to the error handler",
            metrics.errors.clone(),
        );
        registry.register(
            COMMITS_TOTAL,
            "Total number of successful source acknowledges",
            metrics.commits.clone(),
        );
        registry.register(
            COMMIT_FAILURES_TOTAL,
            "Total number of failed flushes or source acknowledges",
            metrics.commit_failures.clone(),
        );
        metrics
    }
}

static EXECUTOR_METRICS: OnceLock<ExecutorMetrics> = OnceLock::new();

pub(crate) fn executor_metrics() -> &'static ExecutorMetrics {
    EXECUTOR_METRICS.get_or_init(ExecutorMetrics::new)
}

pub(crate) fn stage_labels(stage: &str) -> Vec<(String, String)> {
    vec![(STAGE_LABEL.to_string(), stage.to_string())]
}

pub(crate) fn error_labels(stage: &str, kind: &str) -> Vec<(String, String)> {
    vec![
        (STAGE_LABEL.to_string(), stage.to_string()),
        (ERROR_KIND_LABEL.to_string(), kind.to_string()),
    ]
}

/// Renders every registered metric in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String, std::fmt::Error> {
    // initialize the families so they are exposed even before the first executor runs.
    executor_metrics();

    let mut buffer = String::new();
    let registry = global_registry().registry.lock();
    encode(&mut buffer, &registry)?;
    Ok(buffer)
}
