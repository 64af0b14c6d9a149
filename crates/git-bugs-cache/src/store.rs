//! Seams between the cache and the backing repository.
//!
//! Store errors pass through these traits untouched so callers see exactly what the
//! backend reported.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use git_bugs_core::{Bug, BugId, Identity, IdentityId, MergeOutcome, StoreError};
use git_bugs_store_git::GitStore;

/// Source of truth for bugs.
pub trait BugStore {
    /// Load the full history of a bug.
    ///
    /// # Errors
    /// [`StoreError::BugNotFound`] when the bug does not exist.
    fn read_bug(&self, id: &BugId) -> Result<Bug, StoreError>;

    /// Lazily enumerate every bug. The sequence may end with an error.
    fn read_all_bugs(&self) -> Box<dyn Iterator<Item = Result<Bug, StoreError>> + '_>;

    /// Commit the staged operations of `bug`.
    ///
    /// # Errors
    /// Returns a store-specific error when the commit cannot be written.
    fn commit_bug(&self, bug: &mut Bug) -> Result<(), StoreError>;
}

/// Source of truth for identities.
pub trait IdentityStore {
    /// Load an identity with every version.
    ///
    /// # Errors
    /// [`StoreError::IdentityNotFound`] when the identity does not exist.
    fn read_identity(&self, id: &IdentityId) -> Result<Identity, StoreError>;

    /// Lazily enumerate every identity. The sequence may end with an error.
    fn read_all_identities(&self) -> Box<dyn Iterator<Item = Result<Identity, StoreError>> + '_>;

    /// Write pending versions of `identity`.
    ///
    /// # Errors
    /// Returns a store-specific error when the commit cannot be written.
    fn commit_identity(&self, identity: &mut Identity) -> Result<(), StoreError>;

    /// Id recorded as the local user's identity.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    fn user_identity_id(&self) -> Result<Option<IdentityId>, StoreError>;

    /// Record the local user's identity.
    ///
    /// # Errors
    /// Fails when the configuration cannot be written.
    fn set_user_identity_id(&self, id: &IdentityId) -> Result<(), StoreError>;
}

/// Repository-level key/value configuration.
pub trait RepoConfig {
    /// Read one value.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    fn config_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write one value.
    ///
    /// # Errors
    /// Fails when the configuration cannot be written.
    fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Every entry whose key starts with `prefix`.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    fn config_read_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError>;

    /// Remove every entry whose key starts with `prefix`.
    ///
    /// # Errors
    /// Fails when the configuration cannot be written.
    fn config_remove_prefix(&self, prefix: &str) -> Result<(), StoreError>;

    /// Editor configured for the repository.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    fn core_editor(&self) -> Result<Option<String>, StoreError> {
        self.config_get("core.editor")
    }

    /// Configured user name.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    fn user_name(&self) -> Result<Option<String>, StoreError> {
        self.config_get("user.name")
    }

    /// Configured user email.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    fn user_email(&self) -> Result<Option<String>, StoreError> {
        self.config_get("user.email")
    }
}

/// Everything the repository cache needs from its backing repository.
pub trait Repository: BugStore + IdentityStore + RepoConfig + Send + Sync {
    /// Private directory holding the lock and the excerpt files.
    fn cache_dir(&self) -> PathBuf;

    /// Working tree root, where project configuration lives.
    fn root(&self) -> &Path;

    /// Fetch remote entities without touching local history.
    ///
    /// # Errors
    /// Transport errors.
    fn fetch(&self, remote: &str) -> Result<String, StoreError>;

    /// Publish local entities.
    ///
    /// # Errors
    /// Transport errors or rejected updates.
    fn push(&self, remote: &str) -> Result<String, StoreError>;

    /// Merge fetched entities into local history, identities first.
    ///
    /// # Errors
    /// Fails when the fetched entities cannot be enumerated.
    fn merge_all(
        &self,
        remote: &str,
    ) -> Result<Box<dyn Iterator<Item = MergeOutcome> + '_>, StoreError>;
}

impl BugStore for GitStore {
    fn read_bug(&self, id: &BugId) -> Result<Bug, StoreError> {
        Self::read_bug(self, id)
    }

    fn read_all_bugs(&self) -> Box<dyn Iterator<Item = Result<Bug, StoreError>> + '_> {
        Self::read_all_bugs(self)
    }

    fn commit_bug(&self, bug: &mut Bug) -> Result<(), StoreError> {
        Self::commit_bug(self, bug)
    }
}

impl IdentityStore for GitStore {
    fn read_identity(&self, id: &IdentityId) -> Result<Identity, StoreError> {
        Self::read_identity(self, id)
    }

    fn read_all_identities(&self) -> Box<dyn Iterator<Item = Result<Identity, StoreError>> + '_> {
        Self::read_all_identities(self)
    }

    fn commit_identity(&self, identity: &mut Identity) -> Result<(), StoreError> {
        Self::commit_identity(self, identity)
    }

    fn user_identity_id(&self) -> Result<Option<IdentityId>, StoreError> {
        Self::user_identity_id(self)
    }

    fn set_user_identity_id(&self, id: &IdentityId) -> Result<(), StoreError> {
        Self::set_user_identity_id(self, id)
    }
}

impl RepoConfig for GitStore {
    fn config_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Self::config_get(self, key)
    }

    fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Self::config_set(self, key, value)
    }

    fn config_read_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        Self::config_read_prefix(self, prefix)
    }

    fn config_remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        Self::config_remove_prefix(self, prefix)
    }
}

impl Repository for GitStore {
    fn cache_dir(&self) -> PathBuf {
        self.state_dir()
    }

    fn root(&self) -> &Path {
        Self::root(self)
    }

    fn fetch(&self, remote: &str) -> Result<String, StoreError> {
        Self::fetch(self, remote)
    }

    fn push(&self, remote: &str) -> Result<String, StoreError> {
        Self::push(self, remote)
    }

    fn merge_all(
        &self,
        remote: &str,
    ) -> Result<Box<dyn Iterator<Item = MergeOutcome> + '_>, StoreError> {
        Ok(Box::new(Self::merge_all(self, remote)?))
    }
}
