use std::fmt;
use std::time::Duration;

use crate::cache::ObjectKey;

/// Boxed source error from an underlying client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced while reconciling or while running the controller.
///
/// Every variant except [`Error::CacheSyncTimeout`] is handled by requeueing
/// the work item with backoff. A cache sync timeout aborts controller startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    #[error("conflict writing {kind} {key}")]
    Conflict { kind: String, key: ObjectKey },

    #[error("invalid version {version:?}: {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("invalid version range [{low},{high})")]
    InvalidRange {
        low: semver::Version,
        high: semver::Version,
    },

    #[error("unknown state: {0:?}")]
    UnknownState(String),

    #[error("failed to {verb} {kind} {key}: {source}")]
    ApplyFailure {
        verb: &'static str,
        kind: String,
        key: ObjectKey,
        #[source]
        source: BoxError,
    },

    #[error("failed to get {kind} {key}: {source}")]
    Request {
        kind: String,
        key: ObjectKey,
        #[source]
        source: BoxError,
    },

    #[error("{verb} {kind} {key} timed out after {after:?}")]
    Timeout {
        verb: &'static str,
        kind: String,
        key: ObjectKey,
        after: Duration,
    },

    #[error("timed out waiting for caches to sync")]
    CacheSyncTimeout,

    #[error("{0}")]
    Aggregate(Aggregate),
}

impl Error {
    /// Whether the worker should requeue the item that produced this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::CacheSyncTimeout)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Collapses a set of results into one. Successful entries are dropped,
    /// a single failure is returned as-is, and several failures are wrapped
    /// in [`Error::Aggregate`].
    pub fn aggregate<I>(results: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Result<(), Error>>,
    {
        let mut errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(Aggregate(errors))),
        }
    }
}

/// Several errors reported together.
#[derive(Debug)]
pub struct Aggregate(pub Vec<Error>);

impl Aggregate {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{err}")?;
        }
        f.write_str("]")
    }
}
