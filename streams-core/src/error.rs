use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// failure reported by a stage implementation (adapter, transform, sink).
    #[error("Stage Error - {0}")]
    Stage(String),

    #[error("Graph Error - {0}")]
    Graph(String),

    #[error("Config Error - {0}")]
    Config(String),

    /// the source failed to produce the next envelope.
    #[error("Pull Error - source {stage}: {error}")]
    Pull { stage: String, error: Box<Error> },

    /// a stage failed while processing or forwarding an envelope. Nested when the failure comes
    /// from further downstream.
    #[error("Route Error - stage {stage}: {error}")]
    Route { stage: String, error: Box<Error> },

    /// flushing a sink or acknowledging a source failed.
    #[error("Commit Error - stage {stage}: {error}")]
    Commit { stage: String, error: Box<Error> },

    /// one or more stages failed to close.
    #[error("Close Error - {}", join(.0))]
    Close(Vec<StageError>),

    #[error("Executor is already closed")]
    Closed,

    #[error("Runtime Error - {0}")]
    Runtime(String),
}

impl Error {
    /// Name of the stage the error is attributed to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Error::Pull { stage, .. } | Error::Route { stage, .. } | Error::Commit { stage, .. } => {
                Some(stage)
            }
            _ => None,
        }
    }

    /// Short label of the error kind, used as a metric label.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Error::Stage(_) => "stage",
            Error::Graph(_) => "graph",
            Error::Config(_) => "config",
            Error::Pull { .. } => "pull",
            Error::Route { .. } => "route",
            Error::Commit { .. } => "commit",
            Error::Close(_) => "close",
            Error::Closed => "closed",
            Error::Runtime(_) => "runtime",
        }
    }
}

/// Failure of a single stage, kept with the stage name when several failures are combined.
#[derive(Debug, Clone)]
pub struct StageError {
    pub stage: String,
    pub error: Error,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}

fn join(errors: &[StageError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
