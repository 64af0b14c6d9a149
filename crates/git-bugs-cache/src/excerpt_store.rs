//! Versioned, persisted maps from entity id to excerpt.
//!
//! On disk each store is a JSON document `{"version": 2, "excerpts": {...}}`. The
//! version is probed before the body is decoded, so a file written by a different
//! layout is still recognized as incompatible rather than corrupt.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use git_bugs_core::{BugId, EntityKind, IdentityId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::error::CacheError;
use crate::excerpt::{BugExcerpt, IdentityExcerpt};

/// Version tag written into every cache file. Version 2 added the identity store.
pub const FORMAT_VERSION: u32 = 2;
/// File name of the bug excerpt store.
pub const BUG_CACHE_FILE: &str = "bug-cache";
/// File name of the identity excerpt store.
pub const IDENTITY_CACHE_FILE: &str = "identity-cache";

/// A summary record keyed by entity id.
pub trait Excerpt: Clone + Serialize + DeserializeOwned {
    /// Key type.
    type Id: Ord + Clone + AsRef<str> + Serialize + DeserializeOwned;

    /// Kind of entity summarized.
    const KIND: EntityKind;

    /// Key of this excerpt.
    fn id(&self) -> &Self::Id;

    /// Metadata usable for lookups.
    fn metadata(&self) -> &BTreeMap<String, String>;
}

impl Excerpt for BugExcerpt {
    type Id = BugId;

    const KIND: EntityKind = EntityKind::Bug;

    fn id(&self) -> &BugId {
        &self.id
    }

    fn metadata(&self) -> &BTreeMap<String, String> {
        &self.create_metadata
    }
}

impl Excerpt for IdentityExcerpt {
    type Id = IdentityId;

    const KIND: EntityKind = EntityKind::Identity;

    fn id(&self) -> &IdentityId {
        &self.id
    }

    fn metadata(&self) -> &BTreeMap<String, String> {
        &self.immutable_metadata
    }
}

/// Why a persisted store could not be used.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No cache file.
    #[error("cache file does not exist")]
    Missing,
    /// The file exists but cannot be read or decoded.
    #[error("cache file is unreadable: {0}")]
    Unreadable(String),
    /// The file carries another format version.
    #[error("cache file has format version {0}")]
    Incompatible(u32),
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, K: Ord, E> {
    version: u32,
    excerpts: &'a BTreeMap<K, E>,
}

#[derive(Deserialize)]
struct Envelope<K: Ord, E> {
    excerpts: BTreeMap<K, E>,
}

/// In-memory excerpt map of one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcerptStore<E: Excerpt> {
    excerpts: BTreeMap<E::Id, E>,
}

/// Bug excerpts.
pub type BugExcerpts = ExcerptStore<BugExcerpt>;
/// Identity excerpts.
pub type IdentityExcerpts = ExcerptStore<IdentityExcerpt>;

impl<E: Excerpt> Default for ExcerptStore<E> {
    fn default() -> Self {
        Self {
            excerpts: BTreeMap::new(),
        }
    }
}

impl<E: Excerpt> ExcerptStore<E> {
    /// Read a persisted store.
    ///
    /// # Errors
    /// See [`LoadError`].
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(LoadError::Missing),
            Err(err) => return Err(LoadError::Unreadable(err.to_string())),
        };
        let probe: VersionProbe =
            serde_json::from_slice(&bytes).map_err(|err| LoadError::Unreadable(err.to_string()))?;
        if probe.version != FORMAT_VERSION {
            return Err(LoadError::Incompatible(probe.version));
        }
        let envelope: Envelope<E::Id, E> =
            serde_json::from_slice(&bytes).map_err(|err| LoadError::Unreadable(err.to_string()))?;
        Ok(Self {
            excerpts: envelope.excerpts,
        })
    }

    /// Serialize the store and atomically replace the file at `path`.
    ///
    /// # Errors
    /// Returns encoding or filesystem errors; the previous file is left intact.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let body = serde_json::to_vec(&EnvelopeRef {
            version: FORMAT_VERSION,
            excerpts: &self.excerpts,
        })?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(&body)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| err.error)?;
        debug!(
            kind = %E::KIND,
            path = %path.display(),
            count = self.excerpts.len(),
            "Persisted excerpts"
        );
        Ok(())
    }

    /// Build a fresh store from every entity of the backing store.
    ///
    /// Stops at the first error; nothing is persisted.
    ///
    /// # Errors
    /// Propagates the first error produced by `entities`.
    pub fn rebuild<I, Err>(entities: I) -> Result<Self, Err>
    where
        I: IntoIterator<Item = Result<E, Err>>,
    {
        let mut store = Self::default();
        for excerpt in entities {
            store.insert(excerpt?);
        }
        Ok(store)
    }

    /// Excerpt for `id`.
    #[must_use]
    pub fn get(&self, id: &E::Id) -> Option<&E> {
        self.excerpts.get(id)
    }

    /// Whether an excerpt exists for `id`.
    #[must_use]
    pub fn contains(&self, id: &E::Id) -> bool {
        self.excerpts.contains_key(id)
    }

    /// Replace the excerpt for its id, returning the previous one.
    pub fn insert(&mut self, excerpt: E) -> Option<E> {
        self.excerpts.insert(excerpt.id().clone(), excerpt)
    }

    /// Number of excerpts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.excerpts.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.excerpts.is_empty()
    }

    /// Ids in lexicographic order.
    pub fn ids(&self) -> impl Iterator<Item = &E::Id> {
        self.excerpts.keys()
    }

    /// Excerpts in id order.
    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.excerpts.values()
    }

    /// Ids starting with `prefix`, sorted.
    #[must_use]
    pub fn matching_prefix(&self, prefix: &str) -> Vec<E::Id> {
        self.excerpts
            .keys()
            .filter(|id| id.as_ref().starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Ids whose metadata maps `key` to `value`, sorted.
    #[must_use]
    pub fn matching_metadata(&self, key: &str, value: &str) -> Vec<E::Id> {
        self.excerpts
            .values()
            .filter(|excerpt| excerpt.metadata().get(key).is_some_and(|v| v == value))
            .map(|excerpt| excerpt.id().clone())
            .collect()
    }
}
