//! Domain types for git-bugs: content-addressed bugs and identities.

/// Bugs, operation replay and snapshots.
pub mod bug;
/// Lamport clocks.
pub mod clock;
/// Error types shared with storage backends.
pub mod error;
/// Identifier types.
pub mod id;
/// Identities and their versions.
pub mod identity;
/// Bug labels.
pub mod label;
/// Outcomes of merging remote history.
pub mod merge;
/// Operations and operation packs.
pub mod operation;
/// Bug status.
pub mod status;
/// Free-text matching helpers.
pub mod text_matcher;

pub use bug::{Bug, BugSnapshot, Comment, LabelChangeResult, LabelChangeStatus};
pub use clock::LamportClock;
pub use error::{StoreError, ValidationError};
pub use id::{BugId, EntityKind, IdentityId};
pub use identity::{Identity, IdentityMutator, IdentityVersion};
pub use label::Label;
pub use merge::{MergeOutcome, MergeResult, MergeStatus};
pub use operation::{Operation, OperationKind, OperationPack};
pub use status::Status;
