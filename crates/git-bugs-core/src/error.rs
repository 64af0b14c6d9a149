use std::io;

use thiserror::Error;

use crate::id::{BugId, IdError, IdentityId};

/// Domain rule violations detected while building operations or entities.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Titles must contain visible characters.
    #[error("title is empty")]
    EmptyTitle,
    /// Titles are single line.
    #[error("title must not contain line breaks")]
    MultilineTitle,
    /// Comments need a body.
    #[error("message is empty")]
    EmptyMessage,
    /// A label change must touch at least one label.
    #[error("label change does not add or remove anything")]
    EmptyLabelChange,
    /// Label text is blank or spans lines.
    #[error("invalid label {0:?}")]
    InvalidLabel(String),
    /// Identities need a name or a login.
    #[error("identity needs a name or a login")]
    AnonymousIdentity,
    /// Only the first operation of a bug may create it.
    #[error("create operation is only valid as the first operation")]
    MisplacedCreate,
    /// The first operation of a bug is not a create operation.
    #[error("history does not start with a create operation")]
    MissingCreate,
    /// Stored content does not hash to the identifier it is filed under.
    #[error("content hashes to {actual}, expected {expected}")]
    IdMismatch {
        /// Identifier the entity was stored under.
        expected: String,
        /// Identifier derived from the stored content.
        actual: String,
    },
    /// Malformed identifier.
    #[error(transparent)]
    Id(#[from] IdError),
    /// Founding content could not be encoded for hashing.
    #[error("failed to encode entity content: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors raised by the entity-history backing store.
///
/// The cache layer propagates these unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No bug with this id exists in the repository.
    #[error("bug {0} does not exist")]
    BugNotFound(BugId),
    /// No identity with this id exists in the repository.
    #[error("identity {0} does not exist")]
    IdentityNotFound(IdentityId),
    /// The repository has no configured user identity.
    #[error("no user identity is configured for this repository")]
    NoUserIdentity,
    /// An entity with the same id is already stored.
    #[error("{kind} {id} already exists")]
    AlreadyExists {
        /// Entity kind name.
        kind: &'static str,
        /// Colliding identifier.
        id: String,
    },
    /// Commit requested without staged changes.
    #[error("{0} has no pending changes to commit")]
    NothingToCommit(String),
    /// Entity data violates a domain rule.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Stored data exists but cannot be interpreted.
    #[error("corrupted data in {reference}: {reason}")]
    Corrupt {
        /// Reference or path holding the data.
        reference: String,
        /// What went wrong.
        reason: String,
    },
    /// JSON encoding or decoding failed.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    /// Filesystem access failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Failure inside the storage backend (git, transport, ...).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the error reports a missing entity.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::BugNotFound(_) | Self::IdentityNotFound(_))
    }
}
