//! Git-backed storage for git-bugs entities.
//!
//! Bugs live under `refs/git-bugs/bugs/<id>`, identities under
//! `refs/git-bugs/identities/<id>`. Every commit has an empty tree; the payload is
//! the JSON body of the commit message.

mod clocks;
mod remote;

pub use remote::MergeAll;

use anyhow::{Context, anyhow};
use clocks::Clocks;
use git_bugs_core::{
    Bug, BugId, Identity, IdentityId, IdentityVersion, OperationPack, StoreError,
};
use git2::{ConfigLevel, ErrorCode, Oid, Repository, Signature, Sort};
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const PACK_CACHE_CAPACITY: usize = 512;

/// Namespace of bug refs.
pub const BUGS_REF_PREFIX: &str = "refs/git-bugs/bugs/";
/// Namespace of identity refs.
pub const IDENTITIES_REF_PREFIX: &str = "refs/git-bugs/identities/";
/// Git config key holding the id of the local user's identity.
pub const USER_IDENTITY_KEY: &str = "git-bugs.identity";
/// Directory inside the git dir reserved for git-bugs state.
pub const STATE_DIR: &str = "git-bugs";

const OPS_HEADER: &str = "git-bugs-ops: ";
const IDENTITY_HEADER: &str = "git-bugs-identity: ";
const MERGE_HEADER: &str = "git-bugs-merge: ";

/// Storage based on git refs under `refs/git-bugs/*`.
pub struct GitStore {
    git_dir: PathBuf,
    root: PathBuf,
    clocks: Mutex<Clocks>,
    pack_cache: Mutex<LruCache<Oid, OperationPack>>,
}

impl GitStore {
    /// Discover and open the repository from `cwd_or_repo`.
    ///
    /// # Errors
    /// Returns an error if a Git repository cannot be discovered from the given path,
    /// or the persisted clocks are unreadable.
    pub fn open(cwd_or_repo: impl AsRef<Path>) -> Result<Self, StoreError> {
        let repo = Repository::discover(cwd_or_repo).context("Failed to discover .git")?;
        let git_dir = repo.path().to_path_buf();
        let root = repo
            .workdir()
            .map_or_else(|| git_dir.clone(), Path::to_path_buf);
        let clocks = Clocks::load(git_dir.join(STATE_DIR).join("clocks"))?;
        let capacity = NonZeroUsize::new(PACK_CACHE_CAPACITY)
            .ok_or_else(|| anyhow!("cache capacity must be non-zero"))?;
        debug!(git_dir = %git_dir.display(), "Opened git store");
        Ok(Self {
            git_dir,
            root,
            clocks: Mutex::new(clocks),
            pack_cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Path of the `.git` directory.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Working tree, or the git dir for bare repositories.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory reserved for git-bugs local state (caches, lock, clocks).
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.git_dir.join(STATE_DIR)
    }

    fn repo(&self) -> Result<Repository, StoreError> {
        Ok(Repository::open(&self.git_dir)
            .with_context(|| format!("Failed to open {}", self.git_dir.display()))?)
    }

    fn clocks(&self) -> Result<MutexGuard<'_, Clocks>, StoreError> {
        self.clocks
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("Failed to lock clocks")))
    }

    // ----- bugs -----

    /// Load a bug from its ref.
    ///
    /// # Errors
    /// [`StoreError::BugNotFound`] if the ref is missing; other variants when the
    /// history cannot be decoded.
    pub fn read_bug(&self, id: &BugId) -> Result<Bug, StoreError> {
        let repo = self.repo()?;
        let tip = ref_target(&repo, &bug_ref(id))?
            .ok_or_else(|| StoreError::BugNotFound(id.clone()))?;
        self.read_bug_at(&repo, id, tip)
    }

    /// Ids of every bug in the repository, sorted.
    ///
    /// # Errors
    /// Returns an error if reference enumeration fails.
    pub fn bug_ids(&self) -> Result<Vec<BugId>, StoreError> {
        list_ids(&self.repo()?, BUGS_REF_PREFIX)
    }

    /// Lazily read every bug. Enumeration failures surface as a single error item.
    pub fn read_all_bugs(&self) -> Box<dyn Iterator<Item = Result<Bug, StoreError>> + '_> {
        match self.bug_ids() {
            Ok(ids) => Box::new(ids.into_iter().map(move |id| self.read_bug(&id))),
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }

    fn read_bug_at(&self, repo: &Repository, id: &BugId, tip: Oid) -> Result<Bug, StoreError> {
        let refname = bug_ref(id);
        let mut packs = Vec::new();
        for oid in walk(repo, tip)? {
            if let Some(pack) = self.cached_or_decode_pack(repo, oid, id)? {
                packs.push(pack);
            }
        }
        Bug::from_packs(id.clone(), packs).map_err(|err| StoreError::Corrupt {
            reference: refname,
            reason: err.to_string(),
        })
    }

    fn cached_or_decode_pack(
        &self,
        repo: &Repository,
        oid: Oid,
        id: &BugId,
    ) -> Result<Option<OperationPack>, StoreError> {
        if let Some(pack) = self
            .pack_cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(&oid).cloned())
        {
            return Ok(Some(pack));
        }
        let commit = repo
            .find_commit(oid)
            .with_context(|| format!("Object is not a commit: {oid}"))?;
        let message = commit.message().unwrap_or_default();
        let (head, body) = message.split_once("\n\n").unwrap_or((message.trim_end(), ""));
        if head.starts_with(MERGE_HEADER) {
            return Ok(None);
        }
        if head != format!("{OPS_HEADER}{id}") {
            return Err(StoreError::Corrupt {
                reference: bug_ref(id),
                reason: format!("unexpected commit {oid} in bug history"),
            });
        }
        let pack: OperationPack = serde_json::from_str(body).map_err(|err| StoreError::Corrupt {
            reference: bug_ref(id),
            reason: format!("invalid operation pack in commit {oid}: {err}"),
        })?;
        self.cache_pack(oid, pack.clone());
        Ok(Some(pack))
    }

    fn cache_pack(&self, oid: Oid, pack: OperationPack) {
        if let Ok(mut cache) = self.pack_cache.lock() {
            cache.put(oid, pack);
        }
    }

    /// Commit the staged operations of `bug` as one operation pack.
    ///
    /// # Errors
    /// [`StoreError::NothingToCommit`] without staged operations,
    /// [`StoreError::AlreadyExists`] when a new bug's ref is already taken.
    pub fn commit_bug(&self, bug: &mut Bug) -> Result<(), StoreError> {
        if !bug.has_pending() {
            return Err(StoreError::NothingToCommit(bug.id().to_string()));
        }
        let repo = self.repo()?;
        let refname = bug_ref(bug.id());
        let parent = ref_target(&repo, &refname)?;
        match (parent.is_some(), bug.is_committed()) {
            (true, false) => {
                return Err(StoreError::AlreadyExists {
                    kind: "bug",
                    id: bug.id().to_string(),
                });
            }
            (false, true) => return Err(StoreError::BugNotFound(bug.id().clone())),
            _ => {}
        }

        let (create_time, edit_time) = {
            let mut clocks = self.clocks()?;
            let create_time = if bug.is_committed() {
                bug.create_time()
            } else {
                clocks.bug_create.increment()
            };
            let edit_time = clocks.bug_edit.increment();
            clocks.save()?;
            (create_time, edit_time)
        };

        let pack = bug
            .pending_pack(create_time, edit_time)
            .ok_or_else(|| StoreError::NothingToCommit(bug.id().to_string()))?;
        let body = serde_json::to_string_pretty(&pack)?;
        let message = format!("{OPS_HEADER}{}\n\n{body}", bug.id());
        let parents: Vec<Oid> = parent.into_iter().collect();
        let oid = write_commit(&repo, &refname, &message, &parents)?;

        self.cache_pack(oid, pack.clone());
        bug.mark_committed(pack);
        info!(%oid, %refname, edit_time, "Committed operation pack");
        Ok(())
    }

    // ----- identities -----

    /// Load an identity from its ref.
    ///
    /// # Errors
    /// [`StoreError::IdentityNotFound`] if the ref is missing.
    pub fn read_identity(&self, id: &IdentityId) -> Result<Identity, StoreError> {
        let repo = self.repo()?;
        let tip = ref_target(&repo, &identity_ref(id))?
            .ok_or_else(|| StoreError::IdentityNotFound(id.clone()))?;
        read_identity_at(&repo, id, tip)
    }

    /// Ids of every identity in the repository, sorted.
    ///
    /// # Errors
    /// Returns an error if reference enumeration fails.
    pub fn identity_ids(&self) -> Result<Vec<IdentityId>, StoreError> {
        list_ids(&self.repo()?, IDENTITIES_REF_PREFIX)
    }

    /// Lazily read every identity.
    pub fn read_all_identities(
        &self,
    ) -> Box<dyn Iterator<Item = Result<Identity, StoreError>> + '_> {
        match self.identity_ids() {
            Ok(ids) => Box::new(ids.into_iter().map(move |id| self.read_identity(&id))),
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }

    /// Write every pending version of `identity`, one commit per version.
    ///
    /// # Errors
    /// [`StoreError::NothingToCommit`] without pending versions.
    pub fn commit_identity(&self, identity: &mut Identity) -> Result<(), StoreError> {
        if identity.pending().is_empty() {
            return Err(StoreError::NothingToCommit(identity.id().to_string()));
        }
        let repo = self.repo()?;
        let refname = identity_ref(identity.id());
        let mut parent = ref_target(&repo, &refname)?;
        if parent.is_some() && !identity.is_committed() {
            return Err(StoreError::AlreadyExists {
                kind: "identity",
                id: identity.id().to_string(),
            });
        }
        for version in identity.pending() {
            let body = serde_json::to_string_pretty(version)?;
            let message = format!("{IDENTITY_HEADER}{}\n\n{body}", identity.id());
            let parents: Vec<Oid> = parent.into_iter().collect();
            let oid = write_commit(&repo, &refname, &message, &parents)?;
            info!(%oid, %refname, "Committed identity version");
            parent = Some(oid);
        }
        identity.mark_committed();
        Ok(())
    }

    // ----- configuration -----

    /// Id of the local user's identity, if configured.
    ///
    /// # Errors
    /// Fails when git config is unreadable or holds a malformed id.
    pub fn user_identity_id(&self) -> Result<Option<IdentityId>, StoreError> {
        let Some(raw) = self.config_get(USER_IDENTITY_KEY)? else {
            return Ok(None);
        };
        raw.parse().map(Some).map_err(|err| StoreError::Corrupt {
            reference: USER_IDENTITY_KEY.to_owned(),
            reason: format!("{err}"),
        })
    }

    /// Record `id` as the local user's identity.
    ///
    /// # Errors
    /// Fails when git config cannot be written.
    pub fn set_user_identity_id(&self, id: &IdentityId) -> Result<(), StoreError> {
        self.config_set(USER_IDENTITY_KEY, id.as_str())
    }

    /// Read a single git config value.
    ///
    /// # Errors
    /// Fails when git config is unreadable.
    pub fn config_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let config = self.repo()?.config().context("Failed to open git config")?;
        match config.get_string(key) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to read {key}"))
                .into()),
        }
    }

    /// Write a git config value in the repository-local config.
    ///
    /// # Errors
    /// Fails when git config cannot be written.
    pub fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut config = self.local_config()?;
        config
            .set_str(key, value)
            .with_context(|| format!("Failed to write {key}"))?;
        Ok(())
    }

    /// Every config entry whose name starts with `prefix`.
    ///
    /// # Errors
    /// Fails when git config is unreadable.
    pub fn config_read_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let config = self.repo()?.config().context("Failed to open git config")?;
        let mut entries = config
            .entries(Some(&entry_pattern(prefix)))
            .context("Failed to list git config")?;
        let mut out = BTreeMap::new();
        while let Some(entry) = entries.next() {
            let entry = entry.context("Failed to read git config entry")?;
            if let (Some(name), Some(value)) = (entry.name(), entry.value())
                && name.starts_with(prefix)
            {
                out.insert(name.to_owned(), value.to_owned());
            }
        }
        Ok(out)
    }

    /// Remove every repository-local config entry whose name starts with `prefix`.
    ///
    /// # Errors
    /// Fails when git config cannot be written.
    pub fn config_remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut config = self.local_config()?;
        let mut names = Vec::new();
        {
            let mut entries = config
                .entries(Some(&entry_pattern(prefix)))
                .context("Failed to list git config")?;
            while let Some(entry) = entries.next() {
                let entry = entry.context("Failed to read git config entry")?;
                if let Some(name) = entry.name()
                    && name.starts_with(prefix)
                {
                    names.push(name.to_owned());
                }
            }
        }
        for name in names {
            config
                .remove(&name)
                .with_context(|| format!("Failed to remove {name}"))?;
        }
        Ok(())
    }

    fn local_config(&self) -> Result<git2::Config, StoreError> {
        Ok(self
            .repo()?
            .config()
            .and_then(|config| config.open_level(ConfigLevel::Local))
            .context("Failed to open repository config")?)
    }

    fn witness_bug(&self, bug: &Bug) -> Result<(), StoreError> {
        let mut clocks = self.clocks()?;
        let changed = clocks.bug_create.witness(bug.create_time())
            | clocks.bug_edit.witness(bug.edit_time());
        if changed {
            clocks.save()?;
        }
        Ok(())
    }
}

fn read_identity_at(
    repo: &Repository,
    id: &IdentityId,
    tip: Oid,
) -> Result<Identity, StoreError> {
    let refname = identity_ref(id);
    let mut versions = Vec::new();
    for oid in walk(repo, tip)? {
        let commit = repo
            .find_commit(oid)
            .with_context(|| format!("Object is not a commit: {oid}"))?;
        let message = commit.message().unwrap_or_default();
        let corrupt = |reason: String| StoreError::Corrupt {
            reference: refname.clone(),
            reason,
        };
        let (head, body) = message
            .split_once("\n\n")
            .ok_or_else(|| corrupt(format!("commit {oid} has no body")))?;
        if head != format!("{IDENTITY_HEADER}{id}") {
            return Err(corrupt(format!("unexpected commit {oid} in identity history")));
        }
        let version: IdentityVersion = serde_json::from_str(body)
            .map_err(|err| corrupt(format!("invalid identity version in commit {oid}: {err}")))?;
        versions.push(version);
    }
    Identity::from_versions(id.clone(), versions).map_err(|err| StoreError::Corrupt {
        reference: refname,
        reason: err.to_string(),
    })
}

/// Ref name of a bug.
#[must_use]
pub fn bug_ref(id: &BugId) -> String {
    format!("{BUGS_REF_PREFIX}{id}")
}

/// Ref name of an identity.
#[must_use]
pub fn identity_ref(id: &IdentityId) -> String {
    format!("{IDENTITIES_REF_PREFIX}{id}")
}

fn entry_pattern(prefix: &str) -> String {
    let escaped: String = prefix
        .chars()
        .flat_map(|c| {
            let escape = matches!(
                c,
                '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
            );
            escape.then_some('\\').into_iter().chain(std::iter::once(c))
        })
        .collect();
    format!("^{escaped}")
}

fn ref_target(repo: &Repository, name: &str) -> Result<Option<Oid>, StoreError> {
    match repo.find_reference(name) {
        Ok(reference) => {
            let commit = reference
                .peel_to_commit()
                .with_context(|| format!("Ref {name} does not point to a commit"))?;
            Ok(Some(commit.id()))
        }
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("Failed to look up {name}"))
            .into()),
    }
}

fn list_ids<T>(repo: &Repository, prefix: &str) -> Result<Vec<T>, StoreError>
where
    T: FromStr + Ord,
{
    let mut ids: Vec<T> = list_refs(repo, prefix)?
        .iter()
        .filter_map(|name| name.strip_prefix(prefix))
        .filter_map(|raw| raw.parse().ok())
        .collect();
    ids.sort();
    Ok(ids)
}

fn list_refs(repo: &Repository, prefix: &str) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    let glob = format!("{prefix}*");
    for reference in repo
        .references_glob(&glob)
        .with_context(|| format!("Failed to list {glob}"))?
    {
        let reference = reference.context("Failed to read reference")?;
        if let Some(name) = reference.name() {
            names.push(name.to_owned());
        }
    }
    Ok(names)
}

/// Oids reachable from `tip`, parents before children.
fn walk(repo: &Repository, tip: Oid) -> Result<Vec<Oid>, StoreError> {
    let mut rev = repo.revwalk().context("Failed to start revwalk")?;
    rev.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)
        .context("Failed to sort revwalk")?;
    rev.push(tip).context("Failed to push revwalk tip")?;
    let oids = rev
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to walk history")?;
    Ok(oids)
}

/// Commit an empty tree with `message` on top of `parents` and move `refname` to it.
fn write_commit(
    repo: &Repository,
    refname: &str,
    message: &str,
    parents: &[Oid],
) -> Result<Oid, StoreError> {
    let sig = repo
        .signature()
        .or_else(|_| Signature::now("git-bugs", "git-bugs@localhost"))
        .context("Failed to build signature")?;
    let tree_oid = repo
        .treebuilder(None)
        .and_then(|builder| builder.write())
        .context("Failed to write empty tree")?;
    let tree = repo.find_tree(tree_oid).context("Failed to load empty tree")?;
    let parents = parents
        .iter()
        .map(|oid| repo.find_commit(*oid))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to load parent commit")?;
    let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
    let oid = repo
        .commit(Some(refname), &sig, &sig, message, &tree, &parent_refs)
        .with_context(|| format!("Failed to commit to {refname}"))?;
    Ok(oid)
}
