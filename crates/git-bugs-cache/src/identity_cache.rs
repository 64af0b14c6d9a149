//! Live, cached identity.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use git_bugs_core::{Identity, IdentityId, IdentityMutator};

use crate::error::CacheError;
use crate::excerpt::IdentityExcerpt;
use crate::hook::MutationHook;
use crate::unix_now;

/// The single in-process instance of an identity, handed out by [`crate::RepoCache`].
pub struct IdentityCache {
    id: IdentityId,
    identity: Mutex<Identity>,
    hook: Weak<dyn MutationHook>,
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl IdentityCache {
    pub(crate) fn new(identity: Identity, hook: Weak<dyn MutationHook>) -> Self {
        Self {
            id: identity.id().clone(),
            identity: Mutex::new(identity),
            hook,
        }
    }

    /// Identity id.
    #[must_use]
    pub const fn id(&self) -> &IdentityId {
        &self.id
    }

    /// Current name.
    #[must_use]
    pub fn name(&self) -> String {
        self.entity().name().to_owned()
    }

    /// Current email.
    #[must_use]
    pub fn email(&self) -> String {
        self.entity().email().to_owned()
    }

    /// Current login.
    #[must_use]
    pub fn login(&self) -> Option<String> {
        self.entity().login().map(str::to_owned)
    }

    /// Current avatar location.
    #[must_use]
    pub fn avatar_url(&self) -> Option<String> {
        self.entity().avatar_url().map(str::to_owned)
    }

    /// Name, or login when the name is empty.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.entity().display_name().to_owned()
    }

    /// Metadata captured at creation.
    #[must_use]
    pub fn immutable_metadata(&self) -> BTreeMap<String, String> {
        self.entity().immutable_metadata()
    }

    /// Edit the mutable fields and commit a new version when anything changed.
    ///
    /// Returns whether a version was committed.
    ///
    /// # Errors
    /// Fails when the result would be anonymous or the commit fails.
    pub fn mutate<F>(&self, f: F) -> Result<bool, CacheError>
    where
        F: FnOnce(&mut IdentityMutator),
    {
        let hook = self.hook()?;
        {
            let mut current = self.entity();
            let mut next = current.clone();
            if !next.mutate(unix_now(), f)? {
                return Ok(false);
            }
            hook.commit_identity(&mut next)?;
            *current = next;
        }
        hook.identity_updated(&self.id)?;
        Ok(true)
    }

    pub(crate) fn excerpt(&self) -> IdentityExcerpt {
        IdentityExcerpt::new(&self.entity())
    }

    /// Swap in history merged from a remote.
    pub(crate) fn replace(&self, identity: Identity) {
        *self.entity() = identity;
    }

    fn hook(&self) -> Result<Arc<dyn MutationHook>, CacheError> {
        self.hook.upgrade().ok_or(CacheError::Closed)
    }

    fn entity(&self) -> MutexGuard<'_, Identity> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
