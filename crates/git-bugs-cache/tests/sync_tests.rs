#![allow(missing_docs)]

use anyhow::Result;
use git_bugs_cache::{BugExcerpts, Query, RepoCache, excerpt_store::BUG_CACHE_FILE};
use git_bugs_core::{MergeStatus, Status};
use git_bugs_store_git::GitStore;
use git2::Repository;
use std::path::Path;
use tempfile::TempDir;

fn setup_remote_repo() -> Result<TempDir> {
    let dir = TempDir::new()?;
    Repository::init_bare(dir.path())?;
    Ok(dir)
}

fn setup_cache_with_remote(remote_path: &Path) -> Result<(TempDir, RepoCache<GitStore>)> {
    let dir = TempDir::new()?;
    let repo = Repository::init(dir.path())?;
    repo.remote("origin", &format!("file://{}", remote_path.display()))?;
    let cache = RepoCache::open(GitStore::open(dir.path())?)?;
    Ok((dir, cache))
}

#[test]
fn test_pulled_bugs_are_queryable_and_persisted() -> Result<()> {
    let remote = setup_remote_repo()?;
    let (_alice_dir, alice) = setup_cache_with_remote(remote.path())?;
    let (_bob_dir, bob) = setup_cache_with_remote(remote.path())?;

    let alice_id = alice.new_identity("Alice", "alice@example.com")?;
    alice.set_user_identity(&alice_id)?;
    let bug = alice.new_bug("Shared crash", "happens on both machines")?;
    bug.change_labels(&["bug".into()], &[])?;
    alice.push("origin")?;

    bob.fetch("origin")?;
    assert!(bob.all_bug_ids()?.is_empty(), "fetch must not merge");

    let outcomes = bob.merge_all("origin")?.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.status() == MergeStatus::New));

    let found = bob.query_bugs(Some(&Query::parse("label:bug author:alice")?))?;
    assert_eq!(found, vec![bug.id().clone()]);
    assert_eq!(bob.resolve_identity_prefix(&alice_id.id().as_str()[..8])?.name(), "Alice");

    let persisted = BugExcerpts::load(&bob.cache_dir().join(BUG_CACHE_FILE))?;
    assert!(persisted.contains(bug.id()));
    Ok(())
}

#[test]
fn test_remote_changes_reach_loaded_wrappers() -> Result<()> {
    let remote = setup_remote_repo()?;
    let (_alice_dir, alice) = setup_cache_with_remote(remote.path())?;
    let (_bob_dir, bob) = setup_cache_with_remote(remote.path())?;

    let alice_id = alice.new_identity("Alice", "alice@example.com")?;
    alice.set_user_identity(&alice_id)?;
    let bug = alice.new_bug("Needs triage", "see logs")?;
    alice.push("origin")?;
    bob.fetch("origin")?;
    bob.merge_all("origin")?.collect::<Result<Vec<_>, _>>()?;

    let bobs_view = bob.resolve_bug(bug.id())?;
    assert_eq!(bobs_view.snapshot().status, Status::Open);

    bug.close()?;
    alice.push("origin")?;
    bob.fetch("origin")?;
    let statuses = bob
        .merge_all("origin")?
        .map(|outcome| outcome.map(|o| o.status()))
        .collect::<Result<Vec<_>, _>>()?;
    assert!(statuses.contains(&MergeStatus::Updated));

    assert_eq!(bobs_view.snapshot().status, Status::Closed);
    assert_eq!(bob.bug_excerpt(bug.id())?.status, Status::Closed);
    Ok(())
}
