use crate::{
    BUGS_REF_PREFIX, GitStore, IDENTITIES_REF_PREFIX, MERGE_HEADER, bug_ref, identity_ref,
    list_refs, read_identity_at, ref_target, write_commit,
};
use anyhow::{Context, anyhow};
use git_bugs_core::{
    Bug, BugId, EntityKind, Identity, IdentityId, MergeOutcome, MergeResult, StoreError,
};
use git2::{Oid, PushOptions, RemoteCallbacks, Repository};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

fn tracking_prefix(remote: &str, local_prefix: &str) -> String {
    let suffix = local_prefix.trim_start_matches("refs/");
    format!("refs/remotes/{remote}/{suffix}")
}

impl GitStore {
    /// Fetch every git-bugs ref of `remote` into `refs/remotes/<remote>/git-bugs/*`.
    ///
    /// Local refs are left untouched; see [`GitStore::merge_all`].
    ///
    /// # Errors
    /// Returns an error if the remote is unknown or the transfer fails.
    pub fn fetch(&self, remote: &str) -> Result<String, StoreError> {
        let repo = self.repo()?;
        let mut handle = repo
            .find_remote(remote)
            .with_context(|| format!("Remote {remote} not found"))?;
        let refspec = format!("+refs/git-bugs/*:refs/remotes/{remote}/git-bugs/*");
        handle
            .fetch(&[refspec.as_str()], None, None)
            .with_context(|| format!("Failed to fetch from {remote}"))?;
        let stats = handle.stats();
        let transcript = format!(
            "From {}\n * received {} objects ({} bytes)\n",
            handle.url().unwrap_or(remote),
            stats.received_objects(),
            stats.received_bytes()
        );
        info!(remote, objects = stats.received_objects(), "Fetched git-bugs refs");
        Ok(transcript)
    }

    /// Push every local bug and identity ref to `remote`.
    ///
    /// # Errors
    /// Returns an error if the remote is unknown, the transfer fails, or the remote
    /// rejects a ref (for example a non fast-forward update).
    pub fn push(&self, remote: &str) -> Result<String, StoreError> {
        let repo = self.repo()?;
        let mut handle = repo
            .find_remote(remote)
            .with_context(|| format!("Remote {remote} not found"))?;

        let mut refs = list_refs(&repo, IDENTITIES_REF_PREFIX)?;
        refs.extend(list_refs(&repo, BUGS_REF_PREFIX)?);
        let url = handle.url().unwrap_or(remote).to_owned();
        if refs.is_empty() {
            return Ok(format!("To {url}\nEverything up-to-date\n"));
        }
        let specs: Vec<String> = refs.iter().map(|name| format!("{name}:{name}")).collect();

        let mut rejected = Vec::new();
        {
            let mut callbacks = RemoteCallbacks::new();
            callbacks.push_update_reference(|refname, status| {
                if let Some(reason) = status {
                    rejected.push(format!("{refname}: {reason}"));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            handle
                .push(&specs, Some(&mut options))
                .with_context(|| format!("Failed to push to {remote}"))?;
        }
        if !rejected.is_empty() {
            return Err(anyhow!("Remote {remote} rejected: {}", rejected.join(", ")).into());
        }

        let transcript: String = std::iter::once(format!("To {url}\n"))
            .chain(refs.iter().map(|name| format!(" * {name}\n")))
            .collect();
        info!(remote, refs = refs.len(), "Pushed git-bugs refs");
        Ok(transcript)
    }

    /// Merge the fetched remote-tracking refs of `remote` into local history.
    ///
    /// Identities come first so that bugs never reference an unknown author.
    /// Merging happens lazily as the iterator is advanced.
    ///
    /// # Errors
    /// Returns an error if the remote-tracking refs cannot be listed.
    pub fn merge_all(&self, remote: &str) -> Result<MergeAll<'_>, StoreError> {
        let repo = self.repo()?;
        let mut queue = VecDeque::new();
        let identity_prefix = tracking_prefix(remote, IDENTITIES_REF_PREFIX);
        for name in list_refs(&repo, &identity_prefix)? {
            queue.push_back((EntityKind::Identity, name));
        }
        let bug_prefix = tracking_prefix(remote, BUGS_REF_PREFIX);
        for name in list_refs(&repo, &bug_prefix)? {
            queue.push_back((EntityKind::Bug, name));
        }
        debug!(remote, refs = queue.len(), "Merging remote git-bugs refs");
        Ok(MergeAll {
            store: self,
            repo,
            queue,
        })
    }
}

/// Lazy sequence of merge outcomes produced by [`GitStore::merge_all`].
pub struct MergeAll<'a> {
    store: &'a GitStore,
    repo: Repository,
    queue: VecDeque<(EntityKind, String)>,
}

impl Iterator for MergeAll<'_> {
    type Item = MergeOutcome;

    fn next(&mut self) -> Option<Self::Item> {
        let (kind, reference) = self.queue.pop_front()?;
        let outcome = match kind {
            EntityKind::Bug => MergeOutcome::Bug(self.merge_bug(&reference)),
            EntityKind::Identity => MergeOutcome::Identity(self.merge_identity(&reference)),
        };
        info!(%reference, status = %outcome.status(), "Merged remote ref");
        Some(outcome)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.queue.len(), Some(self.queue.len()))
    }
}

enum Relation {
    Missing,
    UpToDate,
    FastForward,
    Diverged(Oid),
}

impl MergeAll<'_> {
    fn relation(&self, local_ref: &str, remote_oid: Oid) -> Result<Relation, StoreError> {
        let Some(local) = ref_target(&self.repo, local_ref)? else {
            return Ok(Relation::Missing);
        };
        if local == remote_oid
            || self
                .repo
                .graph_descendant_of(local, remote_oid)
                .context("Failed to compare histories")?
        {
            return Ok(Relation::UpToDate);
        }
        if self
            .repo
            .graph_descendant_of(remote_oid, local)
            .context("Failed to compare histories")?
        {
            return Ok(Relation::FastForward);
        }
        Ok(Relation::Diverged(local))
    }

    fn move_ref(&self, local_ref: &str, target: Oid, create: bool) -> Result<(), StoreError> {
        let log = if create {
            "git-bugs: import from remote"
        } else {
            "git-bugs: fast-forward from remote"
        };
        self.repo
            .reference(local_ref, target, !create, log)
            .with_context(|| format!("Failed to update {local_ref}"))?;
        Ok(())
    }

    fn merge_bug(&self, reference: &str) -> MergeResult<Bug, BugId> {
        let result = parse_id(reference).and_then(|id| self.try_merge_bug(reference, &id));
        result.unwrap_or_else(|error| {
            warn!(%reference, %error, "Failed to merge bug");
            MergeResult::Failed {
                reference: reference.to_owned(),
                error,
            }
        })
    }

    fn try_merge_bug(
        &self,
        reference: &str,
        id: &BugId,
    ) -> Result<MergeResult<Bug, BugId>, StoreError> {
        let remote_oid = ref_target(&self.repo, reference)?
            .ok_or_else(|| anyhow!("Remote ref {reference} vanished"))?;
        let local_ref = bug_ref(id);
        let result = match self.relation(&local_ref, remote_oid)? {
            Relation::UpToDate => return Ok(MergeResult::Unchanged(id.clone())),
            Relation::Missing => {
                let bug = self.store.read_bug_at(&self.repo, id, remote_oid)?;
                self.move_ref(&local_ref, remote_oid, true)?;
                MergeResult::New(bug)
            }
            Relation::FastForward => {
                let bug = self.store.read_bug_at(&self.repo, id, remote_oid)?;
                self.move_ref(&local_ref, remote_oid, false)?;
                MergeResult::Updated(bug)
            }
            Relation::Diverged(local) => {
                self.store.read_bug_at(&self.repo, id, remote_oid)?;
                let message = format!("{MERGE_HEADER}{id}");
                let merged = write_commit(&self.repo, &local_ref, &message, &[local, remote_oid])?;
                MergeResult::Updated(self.store.read_bug_at(&self.repo, id, merged)?)
            }
        };
        if let Some(bug) = result.entity() {
            self.store.witness_bug(bug)?;
        }
        Ok(result)
    }

    fn merge_identity(&self, reference: &str) -> MergeResult<Identity, IdentityId> {
        let result = parse_id(reference).and_then(|id| self.try_merge_identity(reference, &id));
        result.unwrap_or_else(|error| {
            warn!(%reference, %error, "Failed to merge identity");
            MergeResult::Failed {
                reference: reference.to_owned(),
                error,
            }
        })
    }

    fn try_merge_identity(
        &self,
        reference: &str,
        id: &IdentityId,
    ) -> Result<MergeResult<Identity, IdentityId>, StoreError> {
        let remote_oid = ref_target(&self.repo, reference)?
            .ok_or_else(|| anyhow!("Remote ref {reference} vanished"))?;
        let local_ref = identity_ref(id);
        match self.relation(&local_ref, remote_oid)? {
            Relation::UpToDate => Ok(MergeResult::Unchanged(id.clone())),
            Relation::Missing => {
                let identity = read_identity_at(&self.repo, id, remote_oid)?;
                self.move_ref(&local_ref, remote_oid, true)?;
                Ok(MergeResult::New(identity))
            }
            Relation::FastForward => {
                let identity = read_identity_at(&self.repo, id, remote_oid)?;
                self.move_ref(&local_ref, remote_oid, false)?;
                Ok(MergeResult::Updated(identity))
            }
            Relation::Diverged(_) => Err(StoreError::Corrupt {
                reference: reference.to_owned(),
                reason: "identity histories diverged".to_owned(),
            }),
        }
    }
}

fn parse_id<T>(reference: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = reference.rsplit('/').next().unwrap_or_default();
    raw.parse().map_err(|err| StoreError::Corrupt {
        reference: reference.to_owned(),
        reason: format!("invalid id in ref name: {err}"),
    })
}
