//! Filtering and sorting over bug excerpts.
//!
//! Queries never load bugs: every predicate is answered from the excerpt stores.

use git_bugs_core::text_matcher::TextMatcher;
use git_bugs_core::{BugId, IdentityId, Label, Status};
use thiserror::Error;

use crate::excerpt::BugExcerpt;
use crate::excerpt_store::{BugExcerpts, IdentityExcerpts};

/// Sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    /// Lexicographic id.
    Id,
    /// Creation time.
    #[default]
    Creation,
    /// Last edit time.
    Edit,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Oldest or smallest first.
    Ascending,
    /// Newest or largest first.
    #[default]
    Descending,
}

/// Error returned when a query string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// A double quote was opened and never closed.
    #[error("unbalanced quotes in query")]
    UnbalancedQuotes,
    /// `name:` prefix that is not a known qualifier.
    #[error("unknown qualifier {0:?}")]
    UnknownQualifier(String),
    /// Qualifier given without a value, as in `label:`.
    #[error("qualifier {0:?} needs a value")]
    EmptyValue(String),
    /// Value of `status:` is neither `open` nor `closed`.
    #[error("invalid status {0:?}")]
    InvalidStatus(String),
    /// Value of `metadata:` lacks the `=` separator.
    #[error("metadata filter {0:?} must look like key=value")]
    InvalidMetadata(String),
    /// `no:` followed by anything but `label`.
    #[error("unsupported negation no:{0}")]
    UnknownNegation(String),
    /// Value of `sort:` names no known order.
    #[error("invalid sort order {0:?}")]
    InvalidSort(String),
}

/// Filter and ordering over bugs.
///
/// Status, author, actor and participant filters match when any of their values
/// match. Label, title, metadata and free-text filters must all match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Accepted statuses.
    pub status: Vec<Status>,
    /// Author name or login fragments.
    pub author: Vec<String>,
    /// Fragments matched against every identity that acted on the bug.
    pub actor: Vec<String>,
    /// Fragments matched against the author and commenters.
    pub participant: Vec<String>,
    /// Labels that must all be present.
    pub label: Vec<Label>,
    /// Title fragments.
    pub title: Vec<String>,
    /// Bare search words, matched against the title.
    pub search: Vec<String>,
    /// Founding-operation metadata pairs.
    pub metadata: Vec<(String, String)>,
    /// Only bugs without labels.
    pub no_label: bool,
    /// Sort key.
    pub order_by: OrderBy,
    /// Sort direction.
    pub order_direction: OrderDirection,
}

impl Query {
    /// Query matching every bug, newest first.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a query such as `status:open author:rene label:bug sort:edit-asc crash`.
    ///
    /// Values may be quoted shell-style: `title:"null pointer"`.
    ///
    /// # Errors
    /// Returns a [`QueryError`] on unknown qualifiers or malformed values.
    pub fn parse(input: &str) -> Result<Self, QueryError> {
        let tokens = shell_words::split(input).map_err(|_| QueryError::UnbalancedQuotes)?;
        let mut query = Self::default();
        for token in tokens {
            match token.split_once(':') {
                Some((qualifier, value)) => query.apply(qualifier, value)?,
                None => query.search.push(token),
            }
        }
        Ok(query)
    }

    fn apply(&mut self, qualifier: &str, value: &str) -> Result<(), QueryError> {
        if value.is_empty() {
            return Err(QueryError::EmptyValue(qualifier.to_owned()));
        }
        match qualifier {
            "status" => {
                let status = value
                    .parse()
                    .map_err(|_| QueryError::InvalidStatus(value.to_owned()))?;
                self.status.push(status);
            }
            "author" => self.author.push(value.to_owned()),
            "actor" => self.actor.push(value.to_owned()),
            "participant" => self.participant.push(value.to_owned()),
            "label" => self.label.push(Label::new(value)),
            "title" => self.title.push(value.to_owned()),
            "metadata" => {
                let (key, val) = value
                    .split_once('=')
                    .filter(|(key, _)| !key.is_empty())
                    .ok_or_else(|| QueryError::InvalidMetadata(value.to_owned()))?;
                self.metadata.push((key.to_owned(), val.to_owned()));
            }
            "no" => match value {
                "label" => self.no_label = true,
                other => return Err(QueryError::UnknownNegation(other.to_owned())),
            },
            "sort" => self.apply_sort(value)?,
            other => return Err(QueryError::UnknownQualifier(other.to_owned())),
        }
        Ok(())
    }

    fn apply_sort(&mut self, value: &str) -> Result<(), QueryError> {
        let (key, direction) = match value.rsplit_once('-') {
            Some((key, "asc")) => (key, Some(OrderDirection::Ascending)),
            Some((key, "desc")) => (key, Some(OrderDirection::Descending)),
            _ => (value, None),
        };
        self.order_by = match key {
            "id" => OrderBy::Id,
            "creation" | "created" => OrderBy::Creation,
            "edit" | "edited" => OrderBy::Edit,
            _ => return Err(QueryError::InvalidSort(value.to_owned())),
        };
        if let Some(direction) = direction {
            self.order_direction = direction;
        }
        Ok(())
    }

    /// Add an accepted status.
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status.push(status);
        self
    }

    /// Add an author fragment.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author.push(author.into());
        self
    }

    /// Require a label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<Label>) -> Self {
        self.label.push(label.into());
        self
    }

    /// Require a title fragment.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title.push(title.into());
        self
    }

    /// Require a founding-operation metadata pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Set the ordering.
    #[must_use]
    pub const fn order(mut self, by: OrderBy, direction: OrderDirection) -> Self {
        self.order_by = by;
        self.order_direction = direction;
        self
    }

    /// Whether `excerpt` passes every filter. Identity excerpts resolve author,
    /// actor and participant ids to names; unknown identities never match.
    #[must_use]
    pub fn matches(&self, excerpt: &BugExcerpt, identities: &IdentityExcerpts) -> bool {
        let identity = |id: &IdentityId, fragment: &str| {
            identities.get(id).is_some_and(|found| found.matches(fragment))
        };
        let text = |fragment: &String| {
            TextMatcher::new(fragment).is_none_or(|matcher| matcher.matches(&excerpt.title))
        };

        any_or_empty(&self.status, |status| *status == excerpt.status)
            && any_or_empty(&self.author, |fragment| identity(&excerpt.author, fragment))
            && any_or_empty(&self.actor, |fragment| {
                excerpt.actors.iter().any(|id| identity(id, fragment))
            })
            && any_or_empty(&self.participant, |fragment| {
                excerpt.participants.iter().any(|id| identity(id, fragment))
            })
            && self.label.iter().all(|label| excerpt.labels.contains(label))
            && (!self.no_label || excerpt.labels.is_empty())
            && self.title.iter().all(text)
            && self.search.iter().all(text)
            && self
                .metadata
                .iter()
                .all(|(key, value)| excerpt.create_metadata.get(key) == Some(value))
    }
}

fn any_or_empty<T>(filters: &[T], matches: impl Fn(&T) -> bool) -> bool {
    filters.is_empty() || filters.iter().any(matches)
}

fn sort_key(excerpt: &BugExcerpt, order: OrderBy) -> (u64, i64) {
    match order {
        OrderBy::Id => (0, 0),
        OrderBy::Creation => (excerpt.create_lamport_time, excerpt.create_unix_time),
        OrderBy::Edit => (excerpt.edit_lamport_time, excerpt.edit_unix_time),
    }
}

/// Ids of the bugs matching `query`, in the requested order. Without a query every
/// id is returned.
#[must_use]
pub fn evaluate(
    query: Option<&Query>,
    bugs: &BugExcerpts,
    identities: &IdentityExcerpts,
) -> Vec<BugId> {
    let Some(query) = query else {
        return bugs.ids().cloned().collect();
    };
    let mut hits: Vec<&BugExcerpt> = bugs
        .values()
        .filter(|excerpt| query.matches(excerpt, identities))
        .collect();
    let order = query.order_by;
    hits.sort_by(|a, b| {
        sort_key(a, order)
            .cmp(&sort_key(b, order))
            .then_with(|| a.id.cmp(&b.id))
    });
    if query.order_direction == OrderDirection::Descending {
        hits.reverse();
    }
    hits.into_iter().map(|excerpt| excerpt.id.clone()).collect()
}
