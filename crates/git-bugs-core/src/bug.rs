//! Bugs as ordered operation packs, compiled into point-in-time snapshots.

use crate::error::ValidationError;
use crate::id::{BugId, IdentityId};
use crate::label::Label;
use crate::operation::{Operation, OperationKind, OperationPack};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A bug: committed operation packs plus operations staged for the next commit.
#[derive(Debug, Clone)]
pub struct Bug {
    id: BugId,
    packs: Vec<OperationPack>,
    staging: Vec<Operation>,
}

impl Bug {
    /// Start a new bug. The founding operation is staged and determines the id.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] when the title or message is unusable.
    pub fn create(
        author: IdentityId,
        unix_time: i64,
        title: impl Into<String>,
        message: impl Into<String>,
        files: Vec<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        let op = Operation::new(
            author,
            unix_time,
            OperationKind::Create {
                title: title.into(),
                message: message.into(),
                files,
                nonce: Uuid::now_v7(),
            },
        )
        .with_metadata(metadata);
        op.validate()?;
        let id = founding_id(&op)?;
        Ok(Self {
            id,
            packs: Vec::new(),
            staging: vec![op],
        })
    }

    /// Rebuild a bug from packs read out of storage.
    ///
    /// The founding pack goes first; the remaining packs are ordered by edit time,
    /// then wall-clock time.
    ///
    /// # Errors
    /// Fails when the history has no founding operation or does not hash to `id`.
    pub fn from_packs(id: BugId, mut packs: Vec<OperationPack>) -> Result<Self, ValidationError> {
        let create_pos = packs
            .iter()
            .position(|pack| pack.operations.first().is_some_and(Operation::is_create))
            .ok_or(ValidationError::MissingCreate)?;
        let founding = packs.remove(create_pos);
        packs.sort_by_key(|pack| (pack.edit_time, pack.unix_time()));
        packs.insert(0, founding);

        let mut ops = packs.iter().flat_map(|pack| &pack.operations);
        let first = ops.next().ok_or(ValidationError::MissingCreate)?;
        if ops.any(Operation::is_create) {
            return Err(ValidationError::MisplacedCreate);
        }
        let actual = founding_id(first)?;
        if actual != id {
            return Err(ValidationError::IdMismatch {
                expected: id.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(Self {
            id,
            packs,
            staging: Vec::new(),
        })
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> &BugId {
        &self.id
    }

    /// Stage an operation for the next commit.
    ///
    /// # Errors
    /// Rejects invalid payloads and additional founding operations.
    pub fn append(&mut self, op: Operation) -> Result<(), ValidationError> {
        if op.is_create() {
            return Err(ValidationError::MisplacedCreate);
        }
        op.validate()?;
        self.staging.push(op);
        Ok(())
    }

    /// Whether there is anything to commit.
    #[must_use]
    pub const fn has_pending(&self) -> bool {
        !self.staging.is_empty()
    }

    /// Whether at least one pack is in the repository.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        !self.packs.is_empty()
    }

    /// Committed packs in application order.
    #[must_use]
    pub fn packs(&self) -> &[OperationPack] {
        &self.packs
    }

    /// Creation Lamport time, zero before the first commit.
    #[must_use]
    pub fn create_time(&self) -> u64 {
        self.packs.first().and_then(|pack| pack.create_time).unwrap_or(0)
    }

    /// Lamport time of the latest edit, zero before the first commit.
    #[must_use]
    pub fn edit_time(&self) -> u64 {
        self.packs.iter().map(|pack| pack.edit_time).max().unwrap_or(0)
    }

    /// Package the staged operations with the given clock values.
    ///
    /// `create_time` is only recorded on the founding pack.
    #[must_use]
    pub fn pending_pack(&self, create_time: u64, edit_time: u64) -> Option<OperationPack> {
        if self.staging.is_empty() {
            return None;
        }
        Some(OperationPack {
            create_time: (!self.is_committed()).then_some(create_time),
            edit_time,
            operations: self.staging.clone(),
        })
    }

    /// Record `pack` as committed and clear the staging area.
    pub fn mark_committed(&mut self, pack: OperationPack) {
        self.packs.push(pack);
        self.staging.clear();
    }

    /// Replay every committed and staged operation.
    #[must_use]
    pub fn compile(&self) -> BugSnapshot {
        let mut snap = BugSnapshot {
            id: self.id.clone(),
            status: Status::Open,
            title: String::new(),
            comments: Vec::new(),
            labels: BTreeSet::new(),
            author: IdentityId::from_content(&[]),
            actors: BTreeSet::new(),
            participants: BTreeSet::new(),
            create_time: self.create_time(),
            edit_time: self.edit_time(),
            created_at: 0,
            edited_at: 0,
            create_metadata: BTreeMap::new(),
        };
        let ops = self
            .packs
            .iter()
            .flat_map(|pack| &pack.operations)
            .chain(&self.staging);
        for op in ops {
            snap.apply(op);
        }
        snap
    }
}

fn founding_id(op: &Operation) -> Result<BugId, ValidationError> {
    Ok(BugId::from_content(&serde_json::to_vec(op)?))
}

/// A comment on a bug. The founding message is the first comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Author.
    pub author: IdentityId,
    /// Body.
    pub message: String,
    /// Attached file hashes.
    pub files: Vec<String>,
    /// Wall-clock time the comment was written.
    pub unix_time: i64,
}

/// Point-in-time state of a bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugSnapshot {
    /// Identifier.
    pub id: BugId,
    /// Current status.
    pub status: Status,
    /// Current title.
    pub title: String,
    /// Comments in order.
    pub comments: Vec<Comment>,
    /// Current labels.
    pub labels: BTreeSet<Label>,
    /// Creator.
    pub author: IdentityId,
    /// Every identity that authored an operation.
    pub actors: BTreeSet<IdentityId>,
    /// Creator and commenters.
    pub participants: BTreeSet<IdentityId>,
    /// Creation Lamport time.
    pub create_time: u64,
    /// Latest edit Lamport time.
    pub edit_time: u64,
    /// Wall-clock creation time.
    pub created_at: i64,
    /// Wall-clock time of the latest operation.
    pub edited_at: i64,
    /// Metadata of the founding operation.
    pub create_metadata: BTreeMap<String, String>,
}

impl BugSnapshot {
    fn apply(&mut self, op: &Operation) {
        self.actors.insert(op.author.clone());
        self.edited_at = self.edited_at.max(op.unix_time);
        match &op.kind {
            OperationKind::Create {
                title,
                message,
                files,
                ..
            } => {
                self.title.clone_from(title);
                self.author = op.author.clone();
                self.created_at = op.unix_time;
                self.create_metadata.clone_from(&op.metadata);
                self.push_comment(op, message, files);
            }
            OperationKind::SetTitle { title, .. } => self.title.clone_from(title),
            OperationKind::AddComment { message, files } => self.push_comment(op, message, files),
            OperationKind::SetStatus { status } => self.status = *status,
            OperationKind::LabelChange { added, removed } => {
                self.labels.extend(added.iter().cloned());
                for label in removed {
                    self.labels.remove(label);
                }
            }
        }
    }

    fn push_comment(&mut self, op: &Operation, message: &str, files: &[String]) {
        self.participants.insert(op.author.clone());
        self.comments.push(Comment {
            author: op.author.clone(),
            message: message.to_owned(),
            files: files.to_vec(),
            unix_time: op.unix_time,
        });
    }

    /// Per-label outcome of applying a label change to this snapshot.
    #[must_use]
    pub fn label_changes(&self, added: &[Label], removed: &[Label]) -> Vec<LabelChangeResult> {
        let adds = added.iter().map(|label| LabelChangeResult {
            label: label.clone(),
            status: if self.labels.contains(label) {
                LabelChangeStatus::AlreadySet
            } else {
                LabelChangeStatus::Added
            },
        });
        let removes = removed.iter().map(|label| LabelChangeResult {
            label: label.clone(),
            status: if self.labels.contains(label) {
                LabelChangeStatus::Removed
            } else {
                LabelChangeStatus::AlreadyUnset
            },
        });
        adds.chain(removes).collect()
    }
}

/// What a label change did to one label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelChangeStatus {
    /// Newly attached.
    Added,
    /// Detached.
    Removed,
    /// Was already attached; nothing to do.
    AlreadySet,
    /// Was not attached; nothing to do.
    AlreadyUnset,
}

/// Result of a label change for a single label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelChangeResult {
    /// Label concerned.
    pub label: Label,
    /// Outcome.
    pub status: LabelChangeStatus,
}

impl LabelChangeResult {
    /// Whether the label set actually changed.
    #[must_use]
    pub const fn is_effective(&self) -> bool {
        matches!(
            self.status,
            LabelChangeStatus::Added | LabelChangeStatus::Removed
        )
    }
}
