//! The repository cache: excerpt stores, identity maps, lock and write path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use git_bugs_core::{
    Bug, BugId, EntityKind, Identity, IdentityId, Label, MergeOutcome, StoreError,
};
use tracing::{debug, info, warn};

use crate::bug_cache::BugCache;
use crate::config::{CacheConfig, ProjectConfig};
use crate::error::CacheError;
use crate::excerpt::{BugExcerpt, IdentityExcerpt};
use crate::excerpt_store::{
    BUG_CACHE_FILE, BugExcerpts, Excerpt, ExcerptStore, IDENTITY_CACHE_FILE, IdentityExcerpts,
    LoadError,
};
use crate::hook::MutationHook;
use crate::identity_cache::IdentityCache;
use crate::lock::{LockGuard, ProcessProbe, SystemProbe};
use crate::merge::MergeStream;
use crate::query::{Query, evaluate};
use crate::store::Repository;
use crate::unix_now;

struct CacheState {
    bug_excerpts: BugExcerpts,
    identity_excerpts: IdentityExcerpts,
    bugs: HashMap<BugId, Arc<BugCache>>,
    identities: HashMap<IdentityId, Arc<IdentityCache>>,
    user_identity: Option<IdentityId>,
}

pub(crate) struct CacheInner<R> {
    repo: R,
    dir: PathBuf,
    state: Mutex<CacheState>,
    repo_lock: Mutex<Option<LockGuard>>,
    diverged: AtomicBool,
}

/// Cached, lock-protected access to the bugs and identities of one repository.
///
/// Opening takes the repository lock and loads (or rebuilds) the excerpt stores;
/// [`RepoCache::close`] releases the lock. Each entity is loaded at most once per
/// cache and stays resident until the cache is dropped.
///
/// Only one cache may be opened per repository and process. Calls are internally
/// synchronized but callers should still serialize logical operations.
pub struct RepoCache<R> {
    inner: Arc<CacheInner<R>>,
}

impl<R> std::fmt::Debug for RepoCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoCache")
            .field("dir", &self.inner.dir)
            .field("diverged", &self.inner.diverged)
            .finish_non_exhaustive()
    }
}

impl<R: Repository + 'static> RepoCache<R> {
    /// Open the cache with `.git-bugs/config.toml` settings and the system process
    /// probe.
    ///
    /// # Errors
    /// See [`RepoCache::open_with`]; also fails on invalid configuration.
    pub fn open(repo: R) -> Result<Self, CacheError> {
        let config = ProjectConfig::from_workdir(repo.root())
            .map_err(CacheError::Config)?
            .cache;
        Self::open_with(repo, &SystemProbe, config)
    }

    /// Open the cache with an explicit liveness probe and configuration.
    ///
    /// Missing or corrupted excerpt files are rebuilt from the repository.
    ///
    /// # Errors
    /// - [`CacheError::RepositoryLocked`], [`CacheError::CorruptLock`] or
    ///   [`CacheError::StaleLock`] when the lock cannot be taken.
    /// - [`CacheError::IncompatibleCacheFormat`] for excerpt files of another
    ///   format version, unless `config.rebuild_incompatible` is set.
    /// - Store errors raised while rebuilding.
    pub fn open_with(
        repo: R,
        probe: &dyn ProcessProbe,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        let dir = repo.cache_dir();
        let lock = LockGuard::acquire(&dir, probe, config.reclaim_stale_lock)?;
        let (bug_excerpts, identity_excerpts) = load_or_rebuild(&repo, &dir, config)?;
        info!(
            dir = %dir.display(),
            bugs = bug_excerpts.len(),
            identities = identity_excerpts.len(),
            "Opened repository cache"
        );
        Ok(Self {
            inner: Arc::new(CacheInner {
                repo,
                dir,
                state: Mutex::new(CacheState {
                    bug_excerpts,
                    identity_excerpts,
                    bugs: HashMap::new(),
                    identities: HashMap::new(),
                    user_identity: None,
                }),
                repo_lock: Mutex::new(Some(lock)),
                diverged: AtomicBool::new(false),
            }),
        })
    }

    /// Release the repository lock. Wrappers handed out earlier report
    /// [`CacheError::Closed`] on mutation afterwards.
    ///
    /// # Errors
    /// Fails when the lock file cannot be removed.
    pub fn close(self) -> Result<(), CacheError> {
        let guard = self
            .inner
            .repo_lock
            .lock()
            .map_err(|_| CacheError::Invariant("Failed to lock repository lock".into()))?
            .take();
        match guard {
            Some(guard) => guard.release(),
            None => Ok(()),
        }
    }

    /// Backing repository.
    #[must_use]
    pub fn repository(&self) -> &R {
        &self.inner.repo
    }

    /// Directory holding the lock and excerpt files.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Rebuild both excerpt stores from the repository and persist them.
    ///
    /// The in-memory excerpts are replaced only once both files are written.
    ///
    /// # Errors
    /// Store or filesystem errors abort the rebuild. The current excerpts stay in
    /// memory and the bug cache file is restored to its previous content.
    pub fn rebuild(&self) -> Result<(), CacheError> {
        self.inner.ensure_writable()?;
        let (bug_excerpts, identity_excerpts) = build_excerpts(&self.inner.repo)?;
        let mut state = self.inner.state()?;
        save_both(&self.inner.dir, &bug_excerpts, &identity_excerpts)?;
        state.bug_excerpts = bug_excerpts;
        state.identity_excerpts = identity_excerpts;
        info!(
            bugs = state.bug_excerpts.len(),
            identities = state.identity_excerpts.len(),
            "Rebuilt excerpt caches"
        );
        Ok(())
    }

    fn hook(&self) -> Weak<dyn MutationHook> {
        let hook: Weak<CacheInner<R>> = Arc::downgrade(&self.inner);
        hook
    }

    // ----- bugs -----

    /// Bug with exactly this id, loaded on first use.
    ///
    /// Repeated calls return the same wrapper.
    ///
    /// # Errors
    /// Store errors, typically [`StoreError::BugNotFound`].
    pub fn resolve_bug(&self, id: &BugId) -> Result<Arc<BugCache>, CacheError> {
        if let Some(cached) = self.inner.state()?.bugs.get(id) {
            return Ok(Arc::clone(cached));
        }
        let bug = self.inner.repo.read_bug(id)?;
        debug!(%id, "Loaded bug");
        let mut state = self.inner.state()?;
        let cached = state
            .bugs
            .entry(id.clone())
            .or_insert_with(|| Arc::new(BugCache::new(bug, self.hook())));
        Ok(Arc::clone(cached))
    }

    /// Bug whose id starts with `prefix`.
    ///
    /// # Errors
    /// [`CacheError::NotFound`] or [`CacheError::AmbiguousMatch`].
    pub fn resolve_bug_prefix(&self, prefix: &str) -> Result<Arc<BugCache>, CacheError> {
        let matching = self.inner.state()?.bug_excerpts.matching_prefix(prefix);
        let id = single_match(EntityKind::Bug, prefix, matching)?;
        self.resolve_bug(&id)
    }

    /// Bug whose founding operation carries `key = value` metadata.
    ///
    /// # Errors
    /// [`CacheError::NotFound`] or [`CacheError::AmbiguousMatch`].
    pub fn resolve_bug_create_metadata(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Arc<BugCache>, CacheError> {
        let matching = self
            .inner
            .state()?
            .bug_excerpts
            .matching_metadata(key, value);
        let id = single_match(EntityKind::Bug, &format!("{key}={value}"), matching)?;
        self.resolve_bug(&id)
    }

    /// Every known bug id, sorted.
    ///
    /// # Errors
    /// Fails only on internal lock poisoning.
    pub fn all_bug_ids(&self) -> Result<Vec<BugId>, CacheError> {
        Ok(self.inner.state()?.bug_excerpts.ids().cloned().collect())
    }

    /// Excerpt of a bug.
    ///
    /// # Errors
    /// [`CacheError::NotFound`] for unknown ids.
    pub fn bug_excerpt(&self, id: &BugId) -> Result<BugExcerpt, CacheError> {
        self.inner
            .state()?
            .bug_excerpts
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound {
                kind: EntityKind::Bug,
                query: id.to_string(),
            })
    }

    /// Ids of bugs matching `query`, in its order. `None` returns every id.
    ///
    /// # Errors
    /// Fails only on internal lock poisoning.
    pub fn query_bugs(&self, query: Option<&Query>) -> Result<Vec<BugId>, CacheError> {
        let state = self.inner.state()?;
        Ok(evaluate(query, &state.bug_excerpts, &state.identity_excerpts))
    }

    /// Labels currently attached to at least one bug, sorted.
    ///
    /// # Errors
    /// Fails only on internal lock poisoning.
    pub fn valid_labels(&self) -> Result<Vec<Label>, CacheError> {
        let state = self.inner.state()?;
        let labels: BTreeSet<&Label> = state
            .bug_excerpts
            .values()
            .flat_map(|excerpt| &excerpt.labels)
            .collect();
        Ok(labels.into_iter().cloned().collect())
    }

    /// Create a bug authored by the user identity.
    ///
    /// # Errors
    /// Fails without a user identity, on invalid input, or when the commit fails.
    pub fn new_bug(&self, title: &str, message: &str) -> Result<Arc<BugCache>, CacheError> {
        self.new_bug_with_files(title, message, Vec::new())
    }

    /// Create a bug authored by the user identity, attaching file hashes.
    ///
    /// # Errors
    /// See [`RepoCache::new_bug`].
    pub fn new_bug_with_files(
        &self,
        title: &str,
        message: &str,
        files: Vec<String>,
    ) -> Result<Arc<BugCache>, CacheError> {
        let author = self.user_identity()?;
        self.new_bug_raw(&author, unix_now(), title, message, files, BTreeMap::new())
    }

    /// Create a bug with explicit author, time and founding metadata.
    ///
    /// # Errors
    /// Fails on invalid input, when the commit fails, or with
    /// [`CacheError::AlreadyExists`] if the id is already cached.
    pub fn new_bug_raw(
        &self,
        author: &IdentityCache,
        unix_time: i64,
        title: &str,
        message: &str,
        files: Vec<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Arc<BugCache>, CacheError> {
        self.inner.ensure_writable()?;
        let mut bug = Bug::create(author.id().clone(), unix_time, title, message, files, metadata)?;
        self.inner.repo.commit_bug(&mut bug)?;
        let id = bug.id().clone();
        let cached = {
            let mut state = self.inner.state()?;
            if state.bugs.contains_key(&id) {
                return Err(CacheError::AlreadyExists {
                    kind: EntityKind::Bug,
                    id: id.to_string(),
                });
            }
            let cached = Arc::new(BugCache::new(bug, self.hook()));
            state.bugs.insert(id.clone(), Arc::clone(&cached));
            cached
        };
        self.inner.bug_updated(&id)?;
        info!(%id, "Created bug");
        Ok(cached)
    }

    // ----- identities -----

    /// Identity with exactly this id, loaded on first use.
    ///
    /// # Errors
    /// Store errors, typically [`StoreError::IdentityNotFound`].
    pub fn resolve_identity(&self, id: &IdentityId) -> Result<Arc<IdentityCache>, CacheError> {
        if let Some(cached) = self.inner.state()?.identities.get(id) {
            return Ok(Arc::clone(cached));
        }
        let identity = self.inner.repo.read_identity(id)?;
        debug!(%id, "Loaded identity");
        let mut state = self.inner.state()?;
        let cached = state
            .identities
            .entry(id.clone())
            .or_insert_with(|| Arc::new(IdentityCache::new(identity, self.hook())));
        Ok(Arc::clone(cached))
    }

    /// Identity whose id starts with `prefix`.
    ///
    /// # Errors
    /// [`CacheError::NotFound`] or [`CacheError::AmbiguousMatch`].
    pub fn resolve_identity_prefix(&self, prefix: &str) -> Result<Arc<IdentityCache>, CacheError> {
        let matching = self.inner.state()?.identity_excerpts.matching_prefix(prefix);
        let id = single_match(EntityKind::Identity, prefix, matching)?;
        self.resolve_identity(&id)
    }

    /// Identity created with `key = value` metadata.
    ///
    /// # Errors
    /// [`CacheError::NotFound`] or [`CacheError::AmbiguousMatch`].
    pub fn resolve_identity_immutable_metadata(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Arc<IdentityCache>, CacheError> {
        let matching = self
            .inner
            .state()?
            .identity_excerpts
            .matching_metadata(key, value);
        let id = single_match(EntityKind::Identity, &format!("{key}={value}"), matching)?;
        self.resolve_identity(&id)
    }

    /// Every known identity id, sorted.
    ///
    /// # Errors
    /// Fails only on internal lock poisoning.
    pub fn all_identity_ids(&self) -> Result<Vec<IdentityId>, CacheError> {
        Ok(self.inner.state()?.identity_excerpts.ids().cloned().collect())
    }

    /// Excerpt of an identity.
    ///
    /// # Errors
    /// [`CacheError::NotFound`] for unknown ids.
    pub fn identity_excerpt(&self, id: &IdentityId) -> Result<IdentityExcerpt, CacheError> {
        self.inner
            .state()?
            .identity_excerpts
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound {
                kind: EntityKind::Identity,
                query: id.to_string(),
            })
    }

    /// Create an identity from a name and email.
    ///
    /// # Errors
    /// Fails when the identity would be anonymous or the commit fails.
    pub fn new_identity(&self, name: &str, email: &str) -> Result<Arc<IdentityCache>, CacheError> {
        self.new_identity_full(name, email, None, None)
    }

    /// Create an identity with login and avatar.
    ///
    /// # Errors
    /// See [`RepoCache::new_identity`].
    pub fn new_identity_full(
        &self,
        name: &str,
        email: &str,
        login: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<Arc<IdentityCache>, CacheError> {
        self.new_identity_raw(name, email, login, avatar_url, BTreeMap::new())
    }

    /// Create an identity with immutable metadata, e.g. an import origin.
    ///
    /// # Errors
    /// See [`RepoCache::new_identity`]; also [`CacheError::AlreadyExists`] if the id
    /// is already cached.
    pub fn new_identity_raw(
        &self,
        name: &str,
        email: &str,
        login: Option<String>,
        avatar_url: Option<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Arc<IdentityCache>, CacheError> {
        self.inner.ensure_writable()?;
        let mut identity = Identity::new(name, email, login, avatar_url, unix_now(), metadata)?;
        self.inner.repo.commit_identity(&mut identity)?;
        let id = identity.id().clone();
        let cached = {
            let mut state = self.inner.state()?;
            if state.identities.contains_key(&id) {
                return Err(CacheError::AlreadyExists {
                    kind: EntityKind::Identity,
                    id: id.to_string(),
                });
            }
            let cached = Arc::new(IdentityCache::new(identity, self.hook()));
            state.identities.insert(id.clone(), Arc::clone(&cached));
            cached
        };
        self.inner.identity_updated(&id)?;
        info!(%id, "Created identity");
        Ok(cached)
    }

    // ----- user identity -----

    /// Identity of the local user.
    ///
    /// # Errors
    /// [`StoreError::NoUserIdentity`] when none is configured, or resolution errors.
    pub fn user_identity(&self) -> Result<Arc<IdentityCache>, CacheError> {
        let id = self.inner.user_identity_id()?;
        self.resolve_identity(&id)
    }

    /// Record `identity` as the local user.
    ///
    /// # Errors
    /// [`CacheError::Invariant`] when `identity` was not obtained from this cache;
    /// configuration write errors.
    pub fn set_user_identity(&self, identity: &IdentityCache) -> Result<(), CacheError> {
        let owned = self
            .inner
            .state()?
            .identities
            .get(identity.id())
            .is_some_and(|cached| std::ptr::eq(Arc::as_ptr(cached), identity));
        if !owned {
            return Err(CacheError::Invariant(format!(
                "identity {} was not resolved through this cache",
                identity.id()
            )));
        }
        self.inner.repo.set_user_identity_id(identity.id())?;
        self.inner.state()?.user_identity = Some(identity.id().clone());
        info!(id = %identity.id(), "Set user identity");
        Ok(())
    }

    /// Whether a user identity is configured.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    pub fn is_user_identity_set(&self) -> Result<bool, CacheError> {
        if self.inner.state()?.user_identity.is_some() {
            return Ok(true);
        }
        Ok(self.inner.repo.user_identity_id()?.is_some())
    }

    // ----- repository configuration -----

    /// Configured editor.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    pub fn core_editor(&self) -> Result<Option<String>, CacheError> {
        Ok(self.inner.repo.core_editor()?)
    }

    /// Configured user name.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    pub fn user_name(&self) -> Result<Option<String>, CacheError> {
        Ok(self.inner.repo.user_name()?)
    }

    /// Configured user email.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    pub fn user_email(&self) -> Result<Option<String>, CacheError> {
        Ok(self.inner.repo.user_email()?)
    }

    /// Write one configuration value.
    ///
    /// # Errors
    /// Fails when the configuration cannot be written.
    pub fn store_config(&self, key: &str, value: &str) -> Result<(), CacheError> {
        Ok(self.inner.repo.config_set(key, value)?)
    }

    /// Every configuration entry whose key starts with `prefix`.
    ///
    /// # Errors
    /// Fails when the configuration is unreadable.
    pub fn read_configs(&self, prefix: &str) -> Result<BTreeMap<String, String>, CacheError> {
        Ok(self.inner.repo.config_read_prefix(prefix)?)
    }

    /// Remove every configuration entry whose key starts with `prefix`.
    ///
    /// # Errors
    /// Fails when the configuration cannot be written.
    pub fn rm_configs(&self, prefix: &str) -> Result<(), CacheError> {
        Ok(self.inner.repo.config_remove_prefix(prefix)?)
    }

    // ----- remotes -----

    /// Fetch entities from `remote`. Local history and excerpts are unchanged until
    /// [`RepoCache::merge_all`] runs.
    ///
    /// # Errors
    /// Transport errors, unchanged.
    pub fn fetch(&self, remote: &str) -> Result<String, CacheError> {
        Ok(self.inner.repo.fetch(remote)?)
    }

    /// Push local entities to `remote`.
    ///
    /// # Errors
    /// Transport errors, unchanged.
    pub fn push(&self, remote: &str) -> Result<String, CacheError> {
        Ok(self.inner.repo.push(remote)?)
    }

    /// Merge fetched entities, updating excerpts as outcomes are pulled.
    ///
    /// Both excerpt stores are persisted once the returned stream is exhausted;
    /// dropping it early leaves the files behind memory until the next write.
    ///
    /// # Errors
    /// [`CacheError::Diverged`] after an earlier failed merge, or store errors.
    pub fn merge_all(&self, remote: &str) -> Result<MergeStream<'_, R>, CacheError> {
        self.inner.ensure_writable()?;
        let outcomes = self.inner.repo.merge_all(remote)?;
        info!(remote, "Merging remote entities");
        Ok(MergeStream::new(&self.inner, outcomes))
    }
}

impl<R: Repository> CacheInner<R> {
    fn state(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state
            .lock()
            .map_err(|_| CacheError::Invariant("Failed to lock cache state".into()))
    }

    fn ensure_writable(&self) -> Result<(), CacheError> {
        if self.diverged.load(Ordering::Acquire) {
            return Err(CacheError::Diverged);
        }
        Ok(())
    }

    pub(crate) fn mark_diverged(&self) {
        self.diverged.store(true, Ordering::Release);
    }

    /// Fold one merge outcome into the excerpts and any loaded wrapper.
    pub(crate) fn absorb(&self, outcome: &MergeOutcome) -> Result<(), CacheError> {
        match outcome {
            MergeOutcome::Bug(result) => {
                if let Some(bug) = result.entity() {
                    let loaded = {
                        let mut state = self.state()?;
                        state.bug_excerpts.insert(BugExcerpt::from_bug(bug));
                        state.bugs.get(bug.id()).cloned()
                    };
                    if let Some(cached) = loaded {
                        cached.replace(bug.clone());
                    }
                    debug!(id = %bug.id(), status = %result.status(), "Absorbed merged bug");
                }
            }
            MergeOutcome::Identity(result) => {
                if let Some(identity) = result.entity() {
                    let loaded = {
                        let mut state = self.state()?;
                        state.identity_excerpts.insert(IdentityExcerpt::new(identity));
                        state.identities.get(identity.id()).cloned()
                    };
                    if let Some(cached) = loaded {
                        cached.replace(identity.clone());
                    }
                    debug!(
                        id = %identity.id(),
                        status = %result.status(),
                        "Absorbed merged identity"
                    );
                }
            }
        }
        Ok(())
    }

    /// Persist both excerpt stores.
    pub(crate) fn persist_all(&self) -> Result<(), CacheError> {
        let state = self.state()?;
        save_both(&self.dir, &state.bug_excerpts, &state.identity_excerpts)
    }
}

impl<R: Repository> MutationHook for CacheInner<R> {
    fn user_identity_id(&self) -> Result<IdentityId, CacheError> {
        if let Some(id) = self.state()?.user_identity.clone() {
            return Ok(id);
        }
        let id = self
            .repo
            .user_identity_id()?
            .ok_or(StoreError::NoUserIdentity)?;
        self.state()?.user_identity = Some(id.clone());
        Ok(id)
    }

    fn commit_bug(&self, bug: &mut Bug) -> Result<(), CacheError> {
        self.ensure_writable()?;
        Ok(self.repo.commit_bug(bug)?)
    }

    fn bug_updated(&self, id: &BugId) -> Result<(), CacheError> {
        let cached = self
            .state()?
            .bugs
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::Invariant(format!("bug {id} is missing from the cache")))?;
        let excerpt = cached.excerpt();
        let mut state = self.state()?;
        state.bug_excerpts.insert(excerpt);
        state.bug_excerpts.save(&self.dir.join(BUG_CACHE_FILE))
    }

    fn commit_identity(&self, identity: &mut Identity) -> Result<(), CacheError> {
        self.ensure_writable()?;
        Ok(self.repo.commit_identity(identity)?)
    }

    fn identity_updated(&self, id: &IdentityId) -> Result<(), CacheError> {
        let cached = self
            .state()?
            .identities
            .get(id)
            .cloned()
            .ok_or_else(|| {
                CacheError::Invariant(format!("identity {id} is missing from the cache"))
            })?;
        let excerpt = cached.excerpt();
        let mut state = self.state()?;
        state.identity_excerpts.insert(excerpt);
        state
            .identity_excerpts
            .save(&self.dir.join(IDENTITY_CACHE_FILE))
    }
}

fn single_match<Id: AsRef<str>>(
    kind: EntityKind,
    query: &str,
    mut matching: Vec<Id>,
) -> Result<Id, CacheError> {
    if matching.len() > 1 {
        return Err(CacheError::AmbiguousMatch {
            kind,
            matching: matching.iter().map(|id| id.as_ref().to_owned()).collect(),
        });
    }
    matching.pop().ok_or_else(|| CacheError::NotFound {
        kind,
        query: query.to_owned(),
    })
}

fn load_or_rebuild<R: Repository>(
    repo: &R,
    dir: &Path,
    config: CacheConfig,
) -> Result<(BugExcerpts, IdentityExcerpts), CacheError> {
    let bugs = usable(BugExcerpts::load(&dir.join(BUG_CACHE_FILE)), config)?;
    let identities = usable(IdentityExcerpts::load(&dir.join(IDENTITY_CACHE_FILE)), config)?;
    match (bugs, identities) {
        (Some(bugs), Some(identities)) => Ok((bugs, identities)),
        _ => {
            info!(dir = %dir.display(), "Building excerpt caches");
            let (bugs, identities) = build_excerpts(repo)?;
            save_both(dir, &bugs, &identities)?;
            info!(
                bugs = bugs.len(),
                identities = identities.len(),
                "Built excerpt caches"
            );
            Ok((bugs, identities))
        }
    }
}

fn usable<E: Excerpt>(
    loaded: Result<ExcerptStore<E>, LoadError>,
    config: CacheConfig,
) -> Result<Option<ExcerptStore<E>>, CacheError> {
    match loaded {
        Ok(store) => Ok(Some(store)),
        Err(LoadError::Missing) => {
            info!(kind = %E::KIND, "Excerpt cache missing, rebuilding");
            Ok(None)
        }
        Err(LoadError::Unreadable(reason)) => {
            warn!(kind = %E::KIND, %reason, "Excerpt cache unreadable, rebuilding");
            Ok(None)
        }
        Err(LoadError::Incompatible(found)) if config.rebuild_incompatible => {
            warn!(kind = %E::KIND, found, "Rebuilding excerpt cache of another format version");
            Ok(None)
        }
        Err(LoadError::Incompatible(found)) => Err(CacheError::IncompatibleCacheFormat {
            kind: E::KIND,
            found,
        }),
    }
}

fn build_excerpts<R: Repository>(repo: &R) -> Result<(BugExcerpts, IdentityExcerpts), CacheError> {
    let identities = IdentityExcerpts::rebuild(
        repo.read_all_identities()
            .map(|identity| identity.map(|identity| IdentityExcerpt::new(&identity))),
    )?;
    let bugs = BugExcerpts::rebuild(
        repo.read_all_bugs()
            .map(|bug| bug.map(|bug| BugExcerpt::from_bug(&bug))),
    )?;
    Ok((bugs, identities))
}

/// Write both stores, bugs first. When the identity store cannot be written the
/// bug file is put back as it was, so the pair on disk never mixes generations.
fn save_both(
    dir: &Path,
    bugs: &BugExcerpts,
    identities: &IdentityExcerpts,
) -> Result<(), CacheError> {
    let bug_path = dir.join(BUG_CACHE_FILE);
    let previous = match fs::read(&bug_path) {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };
    bugs.save(&bug_path)?;
    if let Err(err) = identities.save(&dir.join(IDENTITY_CACHE_FILE)) {
        let restored = match previous {
            Some(bytes) => fs::write(&bug_path, bytes),
            None => fs::remove_file(&bug_path),
        };
        if let Err(restore) = restored {
            warn!(path = %bug_path.display(), %restore, "Failed to restore bug excerpt cache");
        }
        return Err(err);
    }
    Ok(())
}
