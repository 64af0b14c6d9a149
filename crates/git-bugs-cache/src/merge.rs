//! Merge outcomes flowing through the cache.

use git_bugs_core::{MergeOutcome, MergeStatus};
use tracing::{error, info};

use crate::error::CacheError;
use crate::repo_cache::CacheInner;
use crate::store::Repository;

/// Lazy sequence of merge outcomes returned by [`crate::RepoCache::merge_all`].
///
/// Every `New` or `Updated` outcome is folded into the excerpts before it is
/// yielded. Once the underlying merge is exhausted both excerpt stores are saved;
/// if that fails the stream yields a final [`CacheError::MergePersist`] and the
/// cache refuses further writes.
pub struct MergeStream<'a, R> {
    cache: &'a CacheInner<R>,
    outcomes: Box<dyn Iterator<Item = MergeOutcome> + 'a>,
    changed: usize,
    done: bool,
}

impl<'a, R: Repository> MergeStream<'a, R> {
    pub(crate) fn new(
        cache: &'a CacheInner<R>,
        outcomes: Box<dyn Iterator<Item = MergeOutcome> + 'a>,
    ) -> Self {
        Self {
            cache,
            outcomes,
            changed: 0,
            done: false,
        }
    }

    fn finish(&mut self) -> Option<Result<MergeOutcome, CacheError>> {
        self.done = true;
        match self.cache.persist_all() {
            Ok(()) => {
                info!(changed = self.changed, "Merge complete, excerpts persisted");
                None
            }
            Err(err) => {
                self.cache.mark_diverged();
                error!(%err, "Excerpts could not be persisted after merging");
                Some(Err(CacheError::MergePersist(Box::new(err))))
            }
        }
    }
}

impl<R: Repository> Iterator for MergeStream<'_, R> {
    type Item = Result<MergeOutcome, CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some(outcome) = self.outcomes.next() else {
            return self.finish();
        };
        if matches!(outcome.status(), MergeStatus::New | MergeStatus::Updated) {
            if let Err(err) = self.cache.absorb(&outcome) {
                return Some(Err(err));
            }
            self.changed += 1;
        }
        Some(Ok(outcome))
    }
}
