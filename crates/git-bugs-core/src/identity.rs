//! Identities: versioned author records.

use crate::error::ValidationError;
use crate::id::IdentityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One version of an identity. The first version determines the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityVersion {
    /// Human name.
    pub name: String,
    /// Contact email.
    pub email: String,
    /// Login on an external system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// Avatar location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Wall-clock time the version was written.
    pub unix_time: i64,
    /// Metadata recorded with this version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Random component keeping identical versions distinct.
    pub nonce: Uuid,
}

/// Mutable view of the editable identity fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMutator {
    /// Human name.
    pub name: String,
    /// Contact email.
    pub email: String,
    /// Login on an external system.
    pub login: Option<String>,
    /// Avatar location.
    pub avatar_url: Option<String>,
}

/// An identity and its version history.
#[derive(Debug, Clone)]
pub struct Identity {
    id: IdentityId,
    versions: Vec<IdentityVersion>,
    committed: usize,
}

impl Identity {
    /// Create a new identity with a single uncommitted version.
    ///
    /// # Errors
    /// Fails when neither a name nor a login is given.
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        login: Option<String>,
        avatar_url: Option<String>,
        unix_time: i64,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        let first = IdentityVersion {
            name: name.into(),
            email: email.into(),
            login,
            avatar_url,
            unix_time,
            metadata,
            nonce: Uuid::now_v7(),
        };
        validate(&first)?;
        let id = IdentityId::from_content(&serde_json::to_vec(&first)?);
        Ok(Self {
            id,
            versions: vec![first],
            committed: 0,
        })
    }

    /// Rebuild from versions read out of storage, oldest first.
    ///
    /// # Errors
    /// Fails when there are no versions or they do not hash to `id`.
    pub fn from_versions(
        id: IdentityId,
        versions: Vec<IdentityVersion>,
    ) -> Result<Self, ValidationError> {
        let first = versions.first().ok_or(ValidationError::AnonymousIdentity)?;
        let actual = IdentityId::from_content(&serde_json::to_vec(first)?);
        if actual != id {
            return Err(ValidationError::IdMismatch {
                expected: id.to_string(),
                actual: actual.to_string(),
            });
        }
        let committed = versions.len();
        Ok(Self {
            id,
            versions,
            committed,
        })
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> &IdentityId {
        &self.id
    }

    /// Apply `f` to the editable fields. A new version is staged only when
    /// something changed; the return value tells whether it did.
    ///
    /// # Errors
    /// Fails when the result would be anonymous.
    pub fn mutate<F>(&mut self, unix_time: i64, f: F) -> Result<bool, ValidationError>
    where
        F: FnOnce(&mut IdentityMutator),
    {
        let current = self.latest();
        let before = IdentityMutator {
            name: current.name.clone(),
            email: current.email.clone(),
            login: current.login.clone(),
            avatar_url: current.avatar_url.clone(),
        };
        let mut edited = before.clone();
        f(&mut edited);
        if edited == before {
            return Ok(false);
        }
        let version = IdentityVersion {
            name: edited.name,
            email: edited.email,
            login: edited.login,
            avatar_url: edited.avatar_url,
            unix_time,
            metadata: BTreeMap::new(),
            nonce: Uuid::now_v7(),
        };
        validate(&version)?;
        self.versions.push(version);
        Ok(true)
    }

    /// Versions not yet written to the repository.
    #[must_use]
    pub fn pending(&self) -> &[IdentityVersion] {
        self.versions.get(self.committed..).unwrap_or_default()
    }

    /// Mark every version as written.
    pub const fn mark_committed(&mut self) {
        self.committed = self.versions.len();
    }

    /// Whether the first version is in the repository.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.committed > 0
    }

    /// Every version, oldest first.
    #[must_use]
    pub fn versions(&self) -> &[IdentityVersion] {
        &self.versions
    }

    fn latest(&self) -> &IdentityVersion {
        let last = self.versions.len().saturating_sub(1);
        &self.versions[last]
    }

    /// Current name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.latest().name
    }

    /// Current email.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.latest().email
    }

    /// Current login.
    #[must_use]
    pub fn login(&self) -> Option<&str> {
        self.latest().login.as_deref()
    }

    /// Current avatar location.
    #[must_use]
    pub fn avatar_url(&self) -> Option<&str> {
        self.latest().avatar_url.as_deref()
    }

    /// Name when set, login otherwise.
    #[must_use]
    pub fn display_name(&self) -> &str {
        let latest = self.latest();
        if latest.name.is_empty() {
            latest.login.as_deref().unwrap_or_default()
        } else {
            &latest.name
        }
    }

    /// Metadata across all versions. For each key the oldest value wins.
    #[must_use]
    pub fn immutable_metadata(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for version in &self.versions {
            for (key, value) in &version.metadata {
                out.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        out
    }
}

fn validate(version: &IdentityVersion) -> Result<(), ValidationError> {
    let has_login = version.login.as_deref().is_some_and(|l| !l.trim().is_empty());
    if version.name.trim().is_empty() && !has_login {
        return Err(ValidationError::AnonymousIdentity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    fn rene() -> Identity {
        Identity::new("René", "rene@example.com", None, None, 10, BTreeMap::new())
            .expect("valid identity")
    }

    #[test]
    fn mutate_stages_only_real_changes() {
        let mut id = rene();
        id.mark_committed();
        assert!(id.pending().is_empty());

        let changed = id.mutate(20, |m| m.name = "René".into()).expect("mutate");
        assert!(!changed);

        let changed = id
            .mutate(20, |m| m.login = Some("rdescartes".into()))
            .expect("mutate");
        assert!(changed);
        assert_eq!(id.pending().len(), 1);
        assert_eq!(id.login(), Some("rdescartes"));
    }

    #[test]
    fn creation_metadata_is_immutable_and_part_of_the_id() {
        let metadata = BTreeMap::from([("origin".to_owned(), "github".to_owned())]);
        let mut id = Identity::new("René", "rene@example.com", None, None, 10, metadata)
            .expect("valid identity");

        id.mark_committed();
        id.mutate(20, |m| m.email = "descartes@example.com".into())
            .expect("mutate");
        assert_eq!(id.immutable_metadata()["origin"], "github");

        let reloaded = Identity::from_versions(id.id().clone(), id.versions().to_vec())
            .expect("reload");
        assert_eq!(reloaded.id(), id.id());
    }

    #[test]
    fn display_name_falls_back_to_login() {
        let id = Identity::new("", "", Some("ghost".into()), None, 0, BTreeMap::new())
            .expect("login only");
        assert_eq!(id.display_name(), "ghost");

        let err = Identity::new(" ", "x@y", None, None, 0, BTreeMap::new());
        assert!(matches!(err, Err(ValidationError::AnonymousIdentity)));
    }
}
