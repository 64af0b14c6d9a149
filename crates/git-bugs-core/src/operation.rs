use crate::error::ValidationError;
use crate::id::IdentityId;
use crate::label::Label;
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single edit applied to a bug, stored as JSON inside an operation pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Identity that authored the edit.
    pub author: IdentityId,
    /// Wall-clock time of the edit, seconds since the Unix epoch.
    pub unix_time: i64,
    /// Free-form key/value pairs, e.g. references to an import origin.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Payload.
    pub kind: OperationKind,
}

/// Operation payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OperationKind {
    /// Founding operation of a bug. Its encoding determines the bug id.
    Create {
        /// Initial title.
        title: String,
        /// First comment.
        message: String,
        /// Attached file hashes.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<String>,
        /// Random component keeping identical bugs distinct.
        nonce: Uuid,
    },
    /// Title overwritten.
    SetTitle {
        /// New title.
        title: String,
        /// Title before the change.
        was: String,
    },
    /// Comment appended.
    AddComment {
        /// Comment body.
        message: String,
        /// Attached file hashes.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<String>,
    },
    /// Status changed.
    SetStatus {
        /// New status.
        status: Status,
    },
    /// Labels added and/or removed.
    LabelChange {
        /// Labels added.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        added: Vec<Label>,
        /// Labels removed.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        removed: Vec<Label>,
    },
}

impl Operation {
    /// Build an operation authored by `author` at `unix_time`.
    #[must_use]
    pub const fn new(author: IdentityId, unix_time: i64, kind: OperationKind) -> Self {
        Self {
            author,
            unix_time,
            metadata: BTreeMap::new(),
            kind,
        }
    }

    /// Attach metadata to the operation.
    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether this is a founding operation.
    #[must_use]
    pub const fn is_create(&self) -> bool {
        matches!(self.kind, OperationKind::Create { .. })
    }

    /// Check the payload against domain rules.
    ///
    /// # Errors
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.kind {
            OperationKind::Create { title, message, .. } => {
                validate_title(title)?;
                if message.trim().is_empty() {
                    return Err(ValidationError::EmptyMessage);
                }
                Ok(())
            }
            OperationKind::SetTitle { title, .. } => validate_title(title),
            OperationKind::AddComment { message, .. } => {
                if message.trim().is_empty() {
                    Err(ValidationError::EmptyMessage)
                } else {
                    Ok(())
                }
            }
            OperationKind::SetStatus { .. } => Ok(()),
            OperationKind::LabelChange { added, removed } => {
                if added.is_empty() && removed.is_empty() {
                    return Err(ValidationError::EmptyLabelChange);
                }
                added.iter().chain(removed).try_for_each(Label::validate)
            }
        }
    }
}

fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    if title.contains(['\n', '\r']) {
        return Err(ValidationError::MultilineTitle);
    }
    Ok(())
}

/// A batch of operations committed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPack {
    /// Creation Lamport time, only present on the founding pack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<u64>,
    /// Edit Lamport time of the commit.
    pub edit_time: u64,
    /// Operations, in application order.
    pub operations: Vec<Operation>,
}

impl OperationPack {
    /// Wall-clock time of the first operation, used to order concurrent packs.
    #[must_use]
    pub fn unix_time(&self) -> i64 {
        self.operations.first().map_or(0, |op| op.unix_time)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    fn author() -> IdentityId {
        IdentityId::from_content(b"author")
    }

    #[test]
    fn rejects_blank_and_multiline_titles() {
        let blank = Operation::new(
            author(),
            0,
            OperationKind::SetTitle {
                title: "  ".into(),
                was: "old".into(),
            },
        );
        assert!(matches!(blank.validate(), Err(ValidationError::EmptyTitle)));

        let multi = Operation::new(
            author(),
            0,
            OperationKind::SetTitle {
                title: "a\nb".into(),
                was: "old".into(),
            },
        );
        assert!(matches!(multi.validate(), Err(ValidationError::MultilineTitle)));
    }

    #[test]
    fn label_change_requires_content() {
        let op = Operation::new(
            author(),
            0,
            OperationKind::LabelChange {
                added: vec![],
                removed: vec![],
            },
        );
        assert!(matches!(op.validate(), Err(ValidationError::EmptyLabelChange)));

        let op = Operation::new(
            author(),
            0,
            OperationKind::LabelChange {
                added: vec![Label::new(" ")],
                removed: vec![],
            },
        );
        assert!(matches!(op.validate(), Err(ValidationError::InvalidLabel(_))));
    }

    #[test]
    fn json_uses_type_tag_and_skips_empty_fields() {
        let op = Operation::new(
            author(),
            42,
            OperationKind::AddComment {
                message: "hello".into(),
                files: vec![],
            },
        );
        let value = serde_json::to_value(&op).expect("serialize operation");
        assert_eq!(value["kind"]["type"], "addComment");
        assert!(value.get("metadata").is_none());
        assert!(value["kind"].get("files").is_none());
    }
}
