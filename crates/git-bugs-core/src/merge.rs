use crate::bug::Bug;
use crate::error::StoreError;
use crate::id::{BugId, IdentityId};
use crate::identity::Identity;
use std::fmt;

/// Classification of a merge result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// The entity only existed on the remote.
    New,
    /// Local history gained remote operations.
    Updated,
    /// Nothing to do.
    Unchanged,
    /// The entity could not be merged.
    Failed,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
        })
    }
}

/// Result of merging one remote entity into the local repository.
#[derive(Debug)]
pub enum MergeResult<E, Id> {
    /// Entity imported; carries the merged entity.
    New(E),
    /// Entity changed; carries the merged entity.
    Updated(E),
    /// Entity already up to date.
    Unchanged(Id),
    /// Merge failed for this reference.
    Failed {
        /// Remote reference that was being merged.
        reference: String,
        /// Why.
        error: StoreError,
    },
}

impl<E, Id> MergeResult<E, Id> {
    /// Status of this result.
    #[must_use]
    pub const fn status(&self) -> MergeStatus {
        match self {
            Self::New(_) => MergeStatus::New,
            Self::Updated(_) => MergeStatus::Updated,
            Self::Unchanged(_) => MergeStatus::Unchanged,
            Self::Failed { .. } => MergeStatus::Failed,
        }
    }

    /// Merged entity, for `New` and `Updated` results.
    #[must_use]
    pub const fn entity(&self) -> Option<&E> {
        match self {
            Self::New(entity) | Self::Updated(entity) => Some(entity),
            Self::Unchanged(_) | Self::Failed { .. } => None,
        }
    }
}

/// Merge result for either entity kind.
#[derive(Debug)]
pub enum MergeOutcome {
    /// A bug was considered.
    Bug(MergeResult<Bug, BugId>),
    /// An identity was considered.
    Identity(MergeResult<Identity, IdentityId>),
}

impl MergeOutcome {
    /// Status of the wrapped result.
    #[must_use]
    pub const fn status(&self) -> MergeStatus {
        match self {
            Self::Bug(result) => result.status(),
            Self::Identity(result) => result.status(),
        }
    }
}
