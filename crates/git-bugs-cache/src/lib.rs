//! Cached access to git-bugs repositories.
//!
//! [`RepoCache`] sits between consumers and the git-backed store. It keeps a
//! persisted excerpt of every bug and identity for listing and querying, hands out a
//! single shared wrapper per loaded entity, and holds an advisory lock so only one
//! process works on a repository at a time.

pub mod bug_cache;
pub mod config;
pub mod error;
pub mod excerpt;
pub mod excerpt_store;
pub mod hook;
pub mod identity_cache;
pub mod lock;
pub mod merge;
pub mod query;
pub mod repo_cache;
pub mod store;

pub use bug_cache::BugCache;
pub use config::{CacheConfig, ProjectConfig};
pub use error::CacheError;
pub use excerpt::{BugExcerpt, IdentityExcerpt};
pub use excerpt_store::{BugExcerpts, ExcerptStore, FORMAT_VERSION, IdentityExcerpts, LoadError};
pub use hook::MutationHook;
pub use identity_cache::IdentityCache;
pub use lock::{LockGuard, ProcessProbe, SystemProbe};
pub use merge::MergeStream;
pub use query::{OrderBy, OrderDirection, Query, QueryError};
pub use repo_cache::RepoCache;
pub use store::{BugStore, IdentityStore, RepoConfig, Repository};

/// Current wall-clock time in seconds since the epoch.
pub(crate) fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
