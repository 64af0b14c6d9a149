//! Repository cache behaviour against real git repositories.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git_bugs_cache::excerpt_store::{BUG_CACHE_FILE, IDENTITY_CACHE_FILE};
use git_bugs_cache::{
    BugExcerpt, BugExcerpts, CacheConfig, CacheError, IdentityCache, IdentityExcerpts,
    ProcessProbe, Query, RepoCache, SystemProbe,
};
use git_bugs_core::{Bug, EntityKind, Label, LabelChangeStatus, Status, StoreError};
use git_bugs_store_git::GitStore;
use tempfile::TempDir;

struct NothingRuns;

impl ProcessProbe for NothingRuns {
    fn is_running(&self, _pid: u32) -> bool {
        false
    }
}

fn init_repo() -> TempDir {
    let temp = TempDir::with_prefix("git-bugs-cache-").expect("create temp dir");
    git2::Repository::init(temp.path()).expect("init git repo");
    temp
}

fn open(path: &Path) -> RepoCache<GitStore> {
    RepoCache::open(GitStore::open(path).expect("open store")).expect("open cache")
}

fn open_with_user(path: &Path) -> (RepoCache<GitStore>, Arc<IdentityCache>) {
    let cache = open(path);
    let rene = cache
        .new_identity("René Descartes", "rene@example.com")
        .expect("create identity");
    cache.set_user_identity(&rene).expect("set user identity");
    (cache, rene)
}

fn cache_file(path: &Path, name: &str) -> PathBuf {
    GitStore::open(path).expect("open store").state_dir().join(name)
}

#[test]
fn resolving_twice_returns_the_same_instance() {
    let temp = init_repo();
    let (cache, rene) = open_with_user(temp.path());
    let created = cache.new_bug("Crash on start", "boom").expect("create bug");

    let first = cache.resolve_bug(created.id()).expect("resolve");
    let second = cache.resolve_bug(created.id()).expect("resolve again");
    assert!(Arc::ptr_eq(&created, &first));
    assert!(Arc::ptr_eq(&first, &second));

    let user = cache.user_identity().expect("user identity");
    assert!(Arc::ptr_eq(&user, &rene));
    let id = created.id().clone();
    cache.close().expect("close");

    let reopened = open(temp.path());
    let loaded = reopened.resolve_bug(&id).expect("load from store");
    let again = reopened.resolve_bug(&id).expect("resolve cached");
    assert!(Arc::ptr_eq(&loaded, &again));
    assert_eq!(loaded.snapshot().title, "Crash on start");
}

#[test]
fn rebuilt_excerpts_match_compiled_history() {
    let temp = init_repo();
    let ids = {
        let (cache, _rene) = open_with_user(temp.path());
        let crash = cache.new_bug("Crash on start", "boom").expect("create bug");
        crash.add_comment("me too").expect("comment");
        crash
            .change_labels(&[Label::new("bug")], &[])
            .expect("label");
        let typo = cache.new_bug("Typo", "in the readme").expect("create bug");
        typo.close().expect("close bug");
        let ids = vec![crash.id().clone(), typo.id().clone()];
        cache.close().expect("close");
        ids
    };

    let bug_path = cache_file(temp.path(), BUG_CACHE_FILE);
    fs::remove_file(&bug_path).expect("remove bug cache");
    fs::remove_file(cache_file(temp.path(), IDENTITY_CACHE_FILE)).expect("remove identity cache");

    let cache = open(temp.path());
    let store = GitStore::open(temp.path()).expect("open store");
    for id in &ids {
        let expected = BugExcerpt::from_bug(&store.read_bug(id).expect("read bug"));
        assert_eq!(cache.bug_excerpt(id).expect("excerpt"), expected);
    }
    assert_eq!(cache.all_bug_ids().expect("ids").len(), 2);
    assert_eq!(cache.all_identity_ids().expect("ids").len(), 1);
    cache.close().expect("close");

    let persisted = BugExcerpts::load(&bug_path).expect("load rebuilt store");
    for id in &ids {
        let expected = BugExcerpt::from_bug(&store.read_bug(id).expect("read bug"));
        assert_eq!(persisted.get(id), Some(&expected));
    }
}

fn commit_behind_the_cache(path: &Path, author: &IdentityCache, title: &str) -> Bug {
    let mut bug = Bug::create(
        author.id().clone(),
        1_700_000_000,
        title,
        "written without the cache",
        vec![],
        BTreeMap::new(),
    )
    .expect("valid bug");
    GitStore::open(path)
        .expect("open store")
        .commit_bug(&mut bug)
        .expect("commit bug");
    bug
}

#[test]
fn rebuild_picks_up_bugs_written_behind_the_cache() {
    let temp = init_repo();
    let (cache, rene) = open_with_user(temp.path());
    cache.new_bug("Known", "through the cache").expect("create bug");
    let outside = commit_behind_the_cache(temp.path(), &rene, "Unknown");

    assert!(cache.bug_excerpt(outside.id()).expect_err("not indexed").is_not_found());

    cache.rebuild().expect("rebuild");
    assert_eq!(cache.bug_excerpt(outside.id()).expect("excerpt").title, "Unknown");
    assert_eq!(cache.all_bug_ids().expect("ids").len(), 2);
    let persisted = BugExcerpts::load(&cache.cache_dir().join(BUG_CACHE_FILE)).expect("load");
    assert!(persisted.contains(outside.id()));
}

#[test]
fn failed_rebuild_keeps_memory_and_files_in_step() {
    let temp = init_repo();
    let (cache, rene) = open_with_user(temp.path());
    let known = cache.new_bug("Known", "through the cache").expect("create bug");
    let outside = commit_behind_the_cache(temp.path(), &rene, "Unknown");

    let bug_path = cache.cache_dir().join(BUG_CACHE_FILE);
    let identity_path = cache.cache_dir().join(IDENTITY_CACHE_FILE);
    let bug_bytes = fs::read(&bug_path).expect("read bug cache");
    fs::remove_file(&identity_path).expect("remove identity cache");
    fs::create_dir(&identity_path).expect("block identity cache");
    fs::write(identity_path.join("occupied"), b"x").expect("fill directory");

    cache.rebuild().expect_err("identity cache cannot be written");

    assert_eq!(fs::read(&bug_path).expect("read bug cache"), bug_bytes);
    assert!(cache.bug_excerpt(outside.id()).expect_err("old excerpts kept").is_not_found());
    assert_eq!(cache.bug_excerpt(known.id()).expect("excerpt").title, "Known");
}

#[test]
fn prefix_resolution_refuses_ambiguous_prefixes() {
    let temp = init_repo();
    let (cache, _rene) = open_with_user(temp.path());

    // Seventeen ids over sixteen hex digits guarantee a shared first character.
    let mut by_first: HashMap<char, Vec<String>> = HashMap::new();
    for n in 0..17 {
        let bug = cache
            .new_bug(&format!("Bug number {n}"), "details")
            .expect("create bug");
        let id = bug.id().to_string();
        let first = id.chars().next().expect("non-empty id");
        by_first.entry(first).or_default().push(id);
    }
    let (prefix, mut shared) = by_first
        .into_iter()
        .find(|(_, ids)| ids.len() > 1)
        .expect("pigeonhole");
    shared.sort();

    match cache.resolve_bug_prefix(&prefix.to_string()) {
        Err(CacheError::AmbiguousMatch { kind, matching }) => {
            assert_eq!(kind, EntityKind::Bug);
            assert_eq!(matching, shared);
        }
        other => panic!("expected an ambiguous match, got {other:?}"),
    }

    let target = &shared[0];
    let resolved = cache
        .resolve_bug_prefix(&target[..20])
        .expect("longer prefix is unique");
    assert_eq!(resolved.id().as_str(), target);

    let err = cache.resolve_bug_prefix("zzz").expect_err("no hex id starts with z");
    assert!(err.is_not_found());
}

#[test]
fn mutation_persists_only_the_bug_store() {
    let temp = init_repo();
    let (cache, _rene) = open_with_user(temp.path());
    let bug = cache.new_bug("Old title", "body").expect("create bug");

    let bug_path = cache.cache_dir().join(BUG_CACHE_FILE);
    let identity_path = cache.cache_dir().join(IDENTITY_CACHE_FILE);
    let identity_bytes = fs::read(&identity_path).expect("read identity cache");
    let identity_meta = fs::metadata(&identity_path).expect("identity cache metadata");
    let bug_bytes = fs::read(&bug_path).expect("read bug cache");

    bug.set_title("New title").expect("set title");

    assert_eq!(cache.bug_excerpt(bug.id()).expect("excerpt").title, "New title");
    assert_eq!(fs::read(&identity_path).expect("read identity cache"), identity_bytes);
    let after = fs::metadata(&identity_path).expect("identity cache metadata");
    assert_eq!(
        after.modified().expect("mtime"),
        identity_meta.modified().expect("mtime")
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        assert_eq!(after.ino(), identity_meta.ino());
    }

    assert_ne!(fs::read(&bug_path).expect("read bug cache"), bug_bytes);
    let on_disk = BugExcerpts::load(&bug_path).expect("load bug cache");
    assert_eq!(on_disk.get(bug.id()).expect("persisted").title, "New title");
}

#[test]
fn repository_lock_is_exclusive_until_close() {
    let temp = init_repo();
    let first = open(temp.path());

    let store = GitStore::open(temp.path()).expect("open store");
    let err = RepoCache::open(store).expect_err("second cache must fail");
    assert!(
        matches!(err, CacheError::RepositoryLocked { pid } if pid == std::process::id()),
        "unexpected error: {err}"
    );

    first.close().expect("close");
    open(temp.path()).close().expect("reopen after close");
}

#[test]
fn stale_lock_is_reclaimed_on_open() {
    let temp = init_repo();
    let store = GitStore::open(temp.path()).expect("open store");
    let lock = store.state_dir().join("lock");
    fs::create_dir_all(store.state_dir()).expect("create state dir");
    fs::write(&lock, "999999").expect("write stale lock");

    let cache =
        RepoCache::open_with(store, &NothingRuns, CacheConfig::default()).expect("reclaim lock");
    assert_eq!(
        fs::read_to_string(&lock).expect("read lock"),
        std::process::id().to_string()
    );
    cache.close().expect("close");
    assert!(!lock.exists());

    fs::write(&lock, "999999").expect("write stale lock");
    let config = CacheConfig {
        reclaim_stale_lock: false,
        ..CacheConfig::default()
    };
    let store = GitStore::open(temp.path()).expect("open store");
    let err = RepoCache::open_with(store, &NothingRuns, config).expect_err("stale lock kept");
    assert!(matches!(err, CacheError::StaleLock { pid: 999_999 }));
}

#[test]
fn incompatible_cache_is_fatal_unless_configured() {
    let temp = init_repo();
    open(temp.path()).close().expect("initial build");
    let bug_path = cache_file(temp.path(), BUG_CACHE_FILE);
    fs::write(&bug_path, r#"{"version":1,"bugs":{}}"#).expect("write old cache");

    let store = GitStore::open(temp.path()).expect("open store");
    let err = RepoCache::open(store).expect_err("incompatible");
    assert!(matches!(
        err,
        CacheError::IncompatibleCacheFormat {
            kind: EntityKind::Bug,
            found: 1
        }
    ));
    assert!(!cache_file(temp.path(), "lock").exists(), "failed open releases the lock");

    let config_dir = temp.path().join(".git-bugs");
    fs::create_dir_all(&config_dir).expect("create config dir");
    fs::write(
        config_dir.join("config.toml"),
        "[cache]\nrebuild_incompatible = true\n",
    )
    .expect("write config");
    open(temp.path()).close().expect("rebuild over old cache");
    BugExcerpts::load(&bug_path).expect("rewritten with the current version");
}

#[test]
fn corrupt_cache_is_rebuilt_silently() {
    let temp = init_repo();
    let id = {
        let (cache, _rene) = open_with_user(temp.path());
        let bug = cache.new_bug("Survives", "corruption").expect("create bug");
        let id = bug.id().clone();
        cache.close().expect("close");
        id
    };
    fs::write(cache_file(temp.path(), BUG_CACHE_FILE), b"{\"version\": 2, \"exc")
        .expect("truncate cache");
    fs::write(cache_file(temp.path(), IDENTITY_CACHE_FILE), b"garbage").expect("corrupt cache");

    let cache = open(temp.path());
    assert_eq!(cache.bug_excerpt(&id).expect("excerpt").title, "Survives");
    cache.close().expect("close");
    IdentityExcerpts::load(&cache_file(temp.path(), IDENTITY_CACHE_FILE))
        .expect("identity cache rewritten");
}

#[test]
fn metadata_resolution_follows_prefix_policy() {
    let temp = init_repo();
    let (cache, rene) = open_with_user(temp.path());
    let url = "https://github.com/owner/repo/issues/1";
    let metadata = BTreeMap::from([("github-url".to_owned(), url.to_owned())]);

    let imported = cache
        .new_bug_raw(&rene, 1_600_000_000, "Imported", "from github", vec![], metadata.clone())
        .expect("import bug");
    let found = cache
        .resolve_bug_create_metadata("github-url", url)
        .expect("resolve by metadata");
    assert!(Arc::ptr_eq(&imported, &found));
    assert_eq!(found.snapshot().created_at, 1_600_000_000);

    let err = cache
        .resolve_bug_create_metadata("github-url", "https://example.com")
        .expect_err("unknown value");
    assert!(matches!(err, CacheError::NotFound { kind: EntityKind::Bug, .. }));

    cache
        .new_bug_raw(&rene, 1_600_000_100, "Imported twice", "again", vec![], metadata)
        .expect("import duplicate");
    match cache.resolve_bug_create_metadata("github-url", url) {
        Err(CacheError::AmbiguousMatch { matching, .. }) => assert_eq!(matching.len(), 2),
        other => panic!("expected an ambiguous match, got {other:?}"),
    }

    let ada = cache
        .new_identity_raw(
            "Ada",
            "ada@example.com",
            Some("ada".into()),
            None,
            BTreeMap::from([("github-login".to_owned(), "ada".to_owned())]),
        )
        .expect("import identity");
    let found = cache
        .resolve_identity_immutable_metadata("github-login", "ada")
        .expect("resolve identity by metadata");
    assert!(Arc::ptr_eq(&ada, &found));
    assert_eq!(found.immutable_metadata()["github-login"], "ada");
}

#[test]
fn labels_queries_and_status() {
    let temp = init_repo();
    let (cache, _rene) = open_with_user(temp.path());
    let crash = cache.new_bug("Crash", "boom").expect("create bug");
    let docs = cache.new_bug("Docs", "missing section").expect("create bug");

    let results = crash
        .change_labels(&["bug".into(), "ui".into()], &[])
        .expect("label");
    assert!(results.iter().all(|r| r.status == LabelChangeStatus::Added));
    docs.change_labels(&["docs".into()], &[]).expect("label");
    assert_eq!(
        cache.valid_labels().expect("labels"),
        vec![Label::new("bug"), Label::new("docs"), Label::new("ui")]
    );

    let packs = crash.bug().packs().len();
    let results = crash
        .change_labels(&["bug".into()], &["wontfix".into()])
        .expect("no-op label change");
    assert_eq!(
        results.iter().map(|r| r.status).collect::<Vec<_>>(),
        vec![LabelChangeStatus::AlreadySet, LabelChangeStatus::AlreadyUnset]
    );
    assert_eq!(crash.bug().packs().len(), packs, "nothing committed");

    docs.close().expect("close");
    assert_eq!(docs.snapshot().status, Status::Closed);

    let run = |input: &str| {
        cache
            .query_bugs(Some(&Query::parse(input).expect("parse")))
            .expect("query")
    };
    assert_eq!(run("label:bug"), vec![crash.id().clone()]);
    assert_eq!(run("status:closed"), vec![docs.id().clone()]);
    assert_eq!(run("author:descartes sort:creation-asc"), vec![
        crash.id().clone(),
        docs.id().clone()
    ]);
    assert_eq!(run("sort:edit"), vec![docs.id().clone(), crash.id().clone()]);
    assert_eq!(cache.query_bugs(None).expect("all").len(), 2);
}

#[test]
fn identity_mutation_updates_the_identity_excerpt() {
    let temp = init_repo();
    let (cache, rene) = open_with_user(temp.path());

    let changed = rene
        .mutate(|m| m.login = Some("cogito".into()))
        .expect("mutate");
    assert!(changed);
    assert_eq!(rene.login().as_deref(), Some("cogito"));
    let excerpt = cache.identity_excerpt(rene.id()).expect("excerpt");
    assert_eq!(excerpt.login.as_deref(), Some("cogito"));

    let unchanged = rene
        .mutate(|m| m.name = "René Descartes".into())
        .expect("mutate");
    assert!(!unchanged);

    let err = rene.mutate(|m| {
        m.name.clear();
        m.login = None;
    });
    assert!(matches!(err, Err(CacheError::Store(StoreError::Validation(_)))));
}

#[test]
fn creating_a_bug_needs_a_user_identity() {
    let temp = init_repo();
    let cache = open(temp.path());
    assert!(!cache.is_user_identity_set().expect("config"));
    let err = cache.new_bug("Orphan", "no author").expect_err("no user identity");
    assert!(matches!(err, CacheError::Store(StoreError::NoUserIdentity)));
}

#[test]
fn user_identity_must_come_from_the_same_cache() {
    let ours = init_repo();
    let theirs = init_repo();
    let cache = open(ours.path());
    let other = open(theirs.path());
    let stranger = other
        .new_identity("Stranger", "stranger@example.com")
        .expect("create identity");

    let err = cache.set_user_identity(&stranger).expect_err("foreign wrapper");
    assert!(matches!(err, CacheError::Invariant(_)));
    assert!(!cache.is_user_identity_set().expect("config"));
}

#[test]
fn wrappers_report_closed_after_the_cache_is_gone() {
    let temp = init_repo();
    let (cache, _rene) = open_with_user(temp.path());
    let bug = cache.new_bug("Short lived", "cache").expect("create bug");
    cache.close().expect("close");

    assert!(matches!(bug.add_comment("too late"), Err(CacheError::Closed)));
    assert_eq!(bug.snapshot().comments.len(), 1);
}

#[test]
fn configuration_passes_through_to_git() {
    let temp = init_repo();
    let cache = open(temp.path());
    cache.store_config("git-bugs.bridge.github.token", "secret").expect("store");
    cache.store_config("git-bugs.bridge.github.owner", "rene").expect("store");
    cache.store_config("user.name", "René").expect("store");

    let bridge = cache.read_configs("git-bugs.bridge.").expect("read");
    assert_eq!(bridge.len(), 2);
    assert_eq!(bridge["git-bugs.bridge.github.owner"], "rene");
    assert_eq!(cache.user_name().expect("user name").as_deref(), Some("René"));

    cache.rm_configs("git-bugs.bridge.").expect("remove");
    assert!(cache.read_configs("git-bugs.bridge.").expect("read").is_empty());

    let probe: &dyn ProcessProbe = &SystemProbe;
    assert!(probe.is_running(std::process::id()));
}
