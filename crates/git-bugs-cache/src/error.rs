use std::io;
use std::path::PathBuf;

use git_bugs_core::{EntityKind, StoreError, ValidationError};
use thiserror::Error;

use crate::excerpt_store::FORMAT_VERSION;
use crate::query::QueryError;

/// Errors surfaced by the repository cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Another live process holds the repository lock.
    #[error("repository is locked by process {pid}")]
    RepositoryLocked {
        /// Owner of the lock.
        pid: u32,
    },
    /// The lock file does not hold a process id. It is never removed automatically.
    #[error(
        "lock file {} is corrupted; remove it by hand once no process uses the repository",
        path.display()
    )]
    CorruptLock {
        /// Location of the lock file.
        path: PathBuf,
    },
    /// The lock names a dead process but reclaiming stale locks is disabled.
    #[error("repository lock was left by process {pid}, which is not running")]
    StaleLock {
        /// Recorded owner of the lock.
        pid: u32,
    },
    /// A persisted cache carries a version tag this build does not understand.
    #[error("{kind} cache has format version {found}, this build expects {FORMAT_VERSION}")]
    IncompatibleCacheFormat {
        /// Cache that was rejected.
        kind: EntityKind,
        /// Version tag found on disk.
        found: u32,
    },
    /// Nothing matched a lookup.
    #[error("no {kind} matching {query:?}")]
    NotFound {
        /// Entity kind searched.
        kind: EntityKind,
        /// Prefix or `key=value` used for the lookup.
        query: String,
    },
    /// More than one entity matched a lookup.
    #[error("multiple {kind} ids match: {}", matching.join(", "))]
    AmbiguousMatch {
        /// Entity kind searched.
        kind: EntityKind,
        /// Every matching id, sorted.
        matching: Vec<String>,
    },
    /// A freshly created entity collides with one already cached.
    #[error("{kind} {id} is already cached")]
    AlreadyExists {
        /// Entity kind.
        kind: EntityKind,
        /// Colliding id.
        id: String,
    },
    /// Internal bookkeeping is inconsistent. Never happens in correct usage.
    #[error("cache invariant violated: {0}")]
    Invariant(String),
    /// Persisting excerpts after a merge failed; memory and disk disagree.
    #[error("failed to persist excerpts after merging")]
    MergePersist(#[source] Box<CacheError>),
    /// A previous merge left memory and disk inconsistent; writes are refused.
    #[error("cache diverged from disk after a failed merge; reopen the repository")]
    Diverged,
    /// The owning cache is gone.
    #[error("the repository cache has been closed")]
    Closed,
    /// A query string could not be parsed.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// `.git-bugs/config.toml` is unreadable or invalid.
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    /// Filesystem access to the cache area failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Cache file encoding failed.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    /// Backing store error, propagated unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    /// Whether the error reports a missing entity, at either layer.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Store(err) => err.is_not_found(),
            _ => false,
        }
    }
}

impl From<ValidationError> for CacheError {
    fn from(err: ValidationError) -> Self {
        Self::Store(StoreError::Validation(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git_bugs_core::BugId;

    #[test]
    fn not_found_spans_both_layers() {
        let cache = CacheError::NotFound {
            kind: EntityKind::Bug,
            query: "abc".into(),
        };
        assert!(cache.is_not_found());

        let store = CacheError::from(StoreError::BugNotFound(BugId::from_content(b"x")));
        assert!(store.is_not_found());
        assert!(!CacheError::Diverged.is_not_found());
    }

    #[test]
    fn ambiguous_match_lists_every_id() {
        let err = CacheError::AmbiguousMatch {
            kind: EntityKind::Bug,
            matching: vec!["abc123".into(), "abc456".into()],
        };
        assert_eq!(err.to_string(), "multiple bug ids match: abc123, abc456");
    }
}
