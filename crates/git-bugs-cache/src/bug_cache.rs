//! Live, cached bug with mutation helpers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use git_bugs_core::{
    Bug, BugId, BugSnapshot, Label, LabelChangeResult, LabelChangeStatus, Operation,
    OperationKind, Status,
};
use tracing::debug;

use crate::error::CacheError;
use crate::excerpt::BugExcerpt;
use crate::hook::MutationHook;
use crate::identity_cache::IdentityCache;
use crate::unix_now as now;

/// The single in-process instance of a bug, handed out by [`crate::RepoCache`].
///
/// Every mutation commits one operation pack and then refreshes the bug's excerpt.
/// A failed commit leaves the bug as it was.
pub struct BugCache {
    id: BugId,
    bug: Mutex<Bug>,
    hook: Weak<dyn MutationHook>,
}

impl std::fmt::Debug for BugCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BugCache").field("id", &self.id).finish_non_exhaustive()
    }
}

impl BugCache {
    pub(crate) fn new(bug: Bug, hook: Weak<dyn MutationHook>) -> Self {
        Self {
            id: bug.id().clone(),
            bug: Mutex::new(bug),
            hook,
        }
    }

    /// Bug id.
    #[must_use]
    pub const fn id(&self) -> &BugId {
        &self.id
    }

    /// Compile the current state.
    #[must_use]
    pub fn snapshot(&self) -> BugSnapshot {
        self.entity().compile()
    }

    /// Copy of the underlying bug.
    #[must_use]
    pub fn bug(&self) -> Bug {
        self.entity().clone()
    }

    /// Comment as the user identity.
    ///
    /// # Errors
    /// Fails without a user identity, on an empty message, or when the commit fails.
    pub fn add_comment(&self, message: &str) -> Result<(), CacheError> {
        self.add_comment_with_files(message, Vec::new())
    }

    /// Comment as the user identity, attaching file hashes.
    ///
    /// # Errors
    /// See [`BugCache::add_comment`].
    pub fn add_comment_with_files(
        &self,
        message: &str,
        files: Vec<String>,
    ) -> Result<(), CacheError> {
        let author = self.hook()?.user_identity_id()?;
        self.apply(Operation::new(
            author,
            now(),
            OperationKind::AddComment {
                message: message.to_owned(),
                files,
            },
        ))
    }

    /// Comment with an explicit author, time and metadata, e.g. while importing.
    ///
    /// # Errors
    /// Fails on an empty message or when the commit fails.
    pub fn add_comment_raw(
        &self,
        author: &IdentityCache,
        unix_time: i64,
        message: &str,
        files: Vec<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), CacheError> {
        let op = Operation::new(
            author.id().clone(),
            unix_time,
            OperationKind::AddComment {
                message: message.to_owned(),
                files,
            },
        )
        .with_metadata(metadata);
        self.apply(op)
    }

    /// Attach and detach labels as the user identity.
    ///
    /// Returns the outcome for every requested label. Nothing is committed when no
    /// label would actually change.
    ///
    /// # Errors
    /// Fails on an invalid label, without a user identity, or when the commit fails.
    pub fn change_labels(
        &self,
        added: &[Label],
        removed: &[Label],
    ) -> Result<Vec<LabelChangeResult>, CacheError> {
        added.iter().chain(removed).try_for_each(Label::validate)?;
        let results = self.snapshot().label_changes(added, removed);
        let effective = |status| {
            results
                .iter()
                .filter(|result| result.status == status)
                .map(|result| result.label.clone())
                .collect::<Vec<_>>()
        };
        let (to_add, to_remove) = (
            effective(LabelChangeStatus::Added),
            effective(LabelChangeStatus::Removed),
        );
        if to_add.is_empty() && to_remove.is_empty() {
            debug!(bug = %self.id, "Label change has no effect");
            return Ok(results);
        }
        let author = self.hook()?.user_identity_id()?;
        self.apply(Operation::new(
            author,
            now(),
            OperationKind::LabelChange {
                added: to_add,
                removed: to_remove,
            },
        ))?;
        Ok(results)
    }

    /// Reopen the bug.
    ///
    /// # Errors
    /// Fails without a user identity or when the commit fails.
    pub fn open(&self) -> Result<(), CacheError> {
        self.set_status(Status::Open)
    }

    /// Close the bug.
    ///
    /// # Errors
    /// Fails without a user identity or when the commit fails.
    pub fn close(&self) -> Result<(), CacheError> {
        self.set_status(Status::Closed)
    }

    fn set_status(&self, status: Status) -> Result<(), CacheError> {
        let author = self.hook()?.user_identity_id()?;
        self.apply(Operation::new(
            author,
            now(),
            OperationKind::SetStatus { status },
        ))
    }

    /// Replace the title.
    ///
    /// # Errors
    /// Fails on an empty or multi-line title, without a user identity, or when the
    /// commit fails.
    pub fn set_title(&self, title: &str) -> Result<(), CacheError> {
        let author = self.hook()?.user_identity_id()?;
        let was = self.snapshot().title;
        self.apply(Operation::new(
            author,
            now(),
            OperationKind::SetTitle {
                title: title.to_owned(),
                was,
            },
        ))
    }

    pub(crate) fn excerpt(&self) -> BugExcerpt {
        BugExcerpt::from_bug(&self.entity())
    }

    /// Swap in history merged from a remote.
    pub(crate) fn replace(&self, bug: Bug) {
        *self.entity() = bug;
    }

    fn apply(&self, op: Operation) -> Result<(), CacheError> {
        let hook = self.hook()?;
        {
            let mut current = self.entity();
            let mut next = current.clone();
            next.append(op)?;
            hook.commit_bug(&mut next)?;
            *current = next;
        }
        hook.bug_updated(&self.id)
    }

    fn hook(&self) -> Result<Arc<dyn MutationHook>, CacheError> {
        self.hook.upgrade().ok_or(CacheError::Closed)
    }

    fn entity(&self) -> MutexGuard<'_, Bug> {
        self.bug.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
