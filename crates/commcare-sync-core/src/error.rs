//! Error types shared across the export pipeline.

use thiserror::Error;

/// A replayable sequence's producer failed during realization.
///
/// Cloneable so that every later realization attempt can return the same
/// failure without re-running the producer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sequence producer failed: {message}")]
pub struct ReplayError {
    pub message: String,
}

impl ReplayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure while evaluating an extraction rule against a record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("{function}: {message}")]
    Function { function: String, message: String },
}

/// Binding a normalized argument to a function signature failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("function `{function}` has no parameter named `{param}`")]
    UnknownParameter { function: String, param: String },
}

/// Query definition could not be parsed or compiled.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid query definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("query defines no tables")]
    Empty,

    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("function `{function}` takes {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("table `{table}` has no columns")]
    NoColumns { table: String },

    #[error("table `{table}` declares heading `{heading}` more than once")]
    DuplicateHeading { table: String, heading: String },

    #[error("table `{table}` uses key `{key}` which is not one of its headings")]
    UnknownKey { table: String, key: String },

    #[error("no ordering fields known for resource `{resource}`; add it to `order_by`")]
    MissingOrder { resource: String },

    #[error("table `{table}` heading `{heading}` is longer than {max} characters")]
    HeadingTooLong {
        table: String,
        heading: String,
        max: usize,
    },

    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Run-level failure surfaced by the export orchestrator.
///
/// None of these advance a checkpoint: the lineage stays resumable from
/// the last committed watermark.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("fetching `{resource}` failed: {message}")]
    TransientFetch { resource: String, message: String },

    #[error("normalizing `{resource}` record {record_id} failed: {message}")]
    Normalization {
        resource: String,
        record_id: String,
        message: String,
    },

    #[error("writing table `{table}` failed: {message}")]
    SinkWrite { table: String, message: String },

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("invalid export options: {0}")]
    Options(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl SyncError {
    pub fn fetch(resource: &str, message: impl ToString) -> Self {
        SyncError::TransientFetch {
            resource: resource.to_string(),
            message: message.to_string(),
        }
    }

    pub fn sink(table: &str, message: impl ToString) -> Self {
        SyncError::SinkWrite {
            table: table.to_string(),
            message: message.to_string(),
        }
    }
}
