//! Error types shared across the engine.

use crate::Side;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A pickup in a submitted run failed validation. The whole run is rejected.
    #[error("pickup {index} ({pickup_id}) is invalid: {source}")]
    Validation {
        index: usize,
        pickup_id: String,
        #[source]
        source: PickupError,
    },

    /// The run could not be assigned to any street segment.
    #[error("invalid run: {0}")]
    InvalidRun(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A query matched nothing it is allowed to return.
    #[error("no data found: {0}")]
    NoDataFound(String),

    /// Another writer updated a blockface statistic first.
    #[error("concurrent update to statistic for segment {segment_id} ({side})")]
    ConcurrencyConflict { segment_id: u64, side: Side },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a single raw pickup was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PickupError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("malformed geometry: {0}")]
    MalformedGeometry(String),

    #[error("expected a POINT geometry, got {0}")]
    WrongGeometryType(&'static str),

    #[error("unparsable timestamp `{0}`")]
    UnparsableTimestamp(String),

    #[error("timestamp {0} is in the future")]
    FutureTimestamp(String),

    #[error("invalid curb `{0}`")]
    InvalidCurb(String),

    #[error("invalid rubbish type `{0}`")]
    InvalidType(String),

    #[error("run id `{found}` does not match submitted run `{expected}`")]
    RunMismatch { expected: String, found: String },
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}
