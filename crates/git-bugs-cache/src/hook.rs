//! Notification path from entity wrappers back to their owning cache.

use git_bugs_core::{Bug, BugId, Identity, IdentityId};

use crate::error::CacheError;

/// Write path and change notifications used by [`crate::BugCache`] and
/// [`crate::IdentityCache`].
///
/// Wrappers hold a `Weak` reference to the implementor and call it synchronously.
/// Implementors must not be called while the caller holds a wrapper's entity lock.
pub trait MutationHook: Send + Sync {
    /// Identity used as the author of changes made without an explicit author.
    ///
    /// # Errors
    /// [`git_bugs_core::StoreError::NoUserIdentity`] when none is configured.
    fn user_identity_id(&self) -> Result<IdentityId, CacheError>;

    /// Commit the staged operations of `bug` to the backing store.
    ///
    /// # Errors
    /// [`CacheError::Diverged`] after a failed merge, store errors otherwise.
    fn commit_bug(&self, bug: &mut Bug) -> Result<(), CacheError>;

    /// A committed change to bug `id` landed; refresh and persist the bug excerpts.
    ///
    /// # Errors
    /// [`CacheError::Invariant`] when `id` is not cached, I/O errors on persistence.
    fn bug_updated(&self, id: &BugId) -> Result<(), CacheError>;

    /// Commit the pending versions of `identity` to the backing store.
    ///
    /// # Errors
    /// [`CacheError::Diverged`] after a failed merge, store errors otherwise.
    fn commit_identity(&self, identity: &mut Identity) -> Result<(), CacheError>;

    /// A committed change to identity `id` landed; refresh and persist the identity
    /// excerpts.
    ///
    /// # Errors
    /// [`CacheError::Invariant`] when `id` is not cached, I/O errors on persistence.
    fn identity_updated(&self, id: &IdentityId) -> Result<(), CacheError>;
}
