//! Lightweight summaries of bugs and identities used for listing and filtering.

use std::collections::{BTreeMap, BTreeSet};

use git_bugs_core::text_matcher::TextMatcher;
use git_bugs_core::{Bug, BugId, BugSnapshot, Identity, IdentityId, Label, Status};
use serde::{Deserialize, Serialize};

/// Everything needed to list, filter and sort a bug without replaying its history.
///
/// Excerpts are replaced wholesale whenever their bug changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugExcerpt {
    /// Bug id.
    pub id: BugId,
    /// Lamport time of creation.
    pub create_lamport_time: u64,
    /// Lamport time of the last edit.
    pub edit_lamport_time: u64,
    /// Wall-clock creation time, seconds since the epoch.
    pub create_unix_time: i64,
    /// Wall-clock time of the last edit.
    pub edit_unix_time: i64,
    /// Current status.
    pub status: Status,
    /// Current labels.
    pub labels: BTreeSet<Label>,
    /// Current title.
    pub title: String,
    /// Number of comments, including the founding message.
    pub len_comments: usize,
    /// Creator.
    pub author: IdentityId,
    /// Identities that authored any operation.
    pub actors: BTreeSet<IdentityId>,
    /// Creator and commenters.
    pub participants: BTreeSet<IdentityId>,
    /// Metadata of the founding operation.
    pub create_metadata: BTreeMap<String, String>,
}

impl BugExcerpt {
    /// Summarize `bug` from its compiled `snapshot`.
    #[must_use]
    pub fn new(bug: &Bug, snapshot: &BugSnapshot) -> Self {
        Self {
            id: bug.id().clone(),
            create_lamport_time: bug.create_time(),
            edit_lamport_time: bug.edit_time(),
            create_unix_time: snapshot.created_at,
            edit_unix_time: snapshot.edited_at,
            status: snapshot.status,
            labels: snapshot.labels.clone(),
            title: snapshot.title.clone(),
            len_comments: snapshot.comments.len(),
            author: snapshot.author.clone(),
            actors: snapshot.actors.clone(),
            participants: snapshot.participants.clone(),
            create_metadata: snapshot.create_metadata.clone(),
        }
    }

    /// Compile `bug` and summarize it.
    #[must_use]
    pub fn from_bug(bug: &Bug) -> Self {
        Self::new(bug, &bug.compile())
    }
}

/// Summary of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityExcerpt {
    /// Identity id.
    pub id: IdentityId,
    /// Human name.
    pub name: String,
    /// Login on an external system.
    pub login: Option<String>,
    /// Avatar location.
    pub avatar_url: Option<String>,
    /// Metadata captured when the identity was created.
    pub immutable_metadata: BTreeMap<String, String>,
}

impl IdentityExcerpt {
    /// Summarize `identity`.
    #[must_use]
    pub fn new(identity: &Identity) -> Self {
        Self {
            id: identity.id().clone(),
            name: identity.name().to_owned(),
            login: identity.login().map(str::to_owned),
            avatar_url: identity.avatar_url().map(str::to_owned),
            immutable_metadata: identity.immutable_metadata(),
        }
    }

    /// Name when set, login otherwise.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.login.as_deref().unwrap_or_default()
        } else {
            &self.name
        }
    }

    /// Whether `query` appears in the name or login, ignoring case.
    #[must_use]
    pub fn matches(&self, query: &str) -> bool {
        TextMatcher::new(query).is_none_or(|matcher| {
            matcher.matches_any(std::iter::once(self.name.as_str()).chain(self.login.as_deref()))
        })
    }
}
