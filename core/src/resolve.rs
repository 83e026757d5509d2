use cgrade_webclient::{self as webclient, PageCursor, Repo, Revision, RevisionHost, UtcDateTime};

use crate::config::HistoryOrdering;

pub type Result<T> = std::result::Result<T, ResolutionError>;

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// Every revision postdates the cutoff: a zero-credit outcome, not a data error.
    #[error("No eligible revision: every commit touching '{path}' is after {cutoff} (earliest {earliest})")]
    TooLate {
        path: String,
        cutoff: UtcDateTime,
        earliest: UtcDateTime,
    },

    #[error("'{path}' has no history on branch '{branch}'")]
    NotFound { path: String, branch: String },

    #[error("Revision host failed: {0}")]
    Host(#[source] webclient::Error),
}

impl ResolutionError {
    pub fn is_too_late(&self) -> bool {
        matches!(self, Self::TooLate { .. })
    }
}

/// Picks the revision of a submission that counts for grading.
#[derive(Debug, Clone)]
pub struct CommitResolver<H> {
    host: H,
    ordering: HistoryOrdering,
}

impl<H: RevisionHost> CommitResolver<H> {
    pub fn new(host: H, ordering: HistoryOrdering) -> Self {
        Self { host, ordering }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Explicit branch, or the repository's default branch.
    pub async fn branch(&self, repo: &Repo, branch: Option<&str>) -> Result<String> {
        match branch {
            Some(b) => Ok(b.to_owned()),
            None => self.host.default_branch(repo).await.map_err(|e| {
                if e.is_not_found() {
                    ResolutionError::NotFound {
                        path: String::new(),
                        branch: "<default>".into(),
                    }
                } else {
                    ResolutionError::Host(e)
                }
            }),
        }
    }

    /// The last revision at or before `cutoff`, or the branch head when there
    /// is no cutoff.
    pub async fn resolve(
        &self,
        repo: &Repo,
        branch: &str,
        path: &str,
        cutoff: Option<UtcDateTime>,
    ) -> Result<Revision> {
        match cutoff {
            Some(cutoff) => self.last_at_or_before(repo, branch, path, cutoff).await,
            None => self
                .host
                .branch_head(repo, branch)
                .await
                .map_err(|e| self.host_error(e, branch, path)),
        }
    }

    pub async fn last_at_or_before(
        &self,
        repo: &Repo,
        branch: &str,
        path: &str,
        cutoff: UtcDateTime,
    ) -> Result<Revision> {
        let mut cursor: Option<PageCursor> = None;
        let mut best: Option<Revision> = None;
        let mut earliest: Option<UtcDateTime> = None;

        loop {
            let page = self
                .host
                .revision_page(repo, branch, path, cursor.as_ref())
                .await
                .map_err(|e| self.host_error(e, branch, path))?;

            for rev in page.revisions {
                earliest = Some(earliest.map_or(rev.committed_at, |t| t.min(rev.committed_at)));
                if rev.committed_at > cutoff {
                    continue;
                }
                match self.ordering {
                    HistoryOrdering::Monotonic => return Ok(rev),
                    HistoryOrdering::Unordered => {
                        // ties keep the entry the host listed first
                        if best.as_ref().map_or(true, |b| rev.committed_at > b.committed_at) {
                            best = Some(rev);
                        }
                    }
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if let Some(rev) = best {
            return Ok(rev);
        }
        match earliest {
            Some(earliest) => Err(ResolutionError::TooLate {
                path: path.to_owned(),
                cutoff,
                earliest,
            }),
            None => Err(ResolutionError::NotFound {
                path: path.to_owned(),
                branch: branch.to_owned(),
            }),
        }
    }

    fn host_error(&self, e: webclient::Error, branch: &str, path: &str) -> ResolutionError {
        if e.is_not_found() {
            ResolutionError::NotFound {
                path: path.to_owned(),
                branch: branch.to_owned(),
            }
        } else {
            ResolutionError::Host(e)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memhost::{at, repo, MemoryHost};
    use std::sync::atomic::Ordering;

    fn three_commits() -> MemoryHost {
        MemoryHost::new()
            .commit("r1", 10, &[("main.c", "v1")])
            .commit("r2", 20, &[("main.c", "v2")])
            .commit("r3", 30, &[("main.c", "v3")])
    }

    async fn resolve_at(host: MemoryHost, cutoff: i64) -> Result<Revision> {
        CommitResolver::new(host, HistoryOrdering::Monotonic)
            .resolve(&repo(), "main", "main.c", Some(at(cutoff)))
            .await
    }

    #[tokio::test]
    async fn should_pick_last_revision_at_or_before_cutoff() {
        assert_eq!(resolve_at(three_commits(), 25).await.unwrap().id, "r2");
        assert_eq!(resolve_at(three_commits(), 35).await.unwrap().id, "r3");
        assert_eq!(resolve_at(three_commits(), 20).await.unwrap().id, "r2");

        let err = resolve_at(three_commits(), 5).await.unwrap_err();
        assert!(err.is_too_late(), "{err:?}");
        assert!(matches!(err, ResolutionError::TooLate { earliest, .. } if earliest == at(10)));
    }

    #[tokio::test]
    async fn should_walk_across_pages() {
        let host = three_commits().page_size(1);
        let resolver = CommitResolver::new(host, HistoryOrdering::Monotonic);
        let rev = resolver
            .resolve(&repo(), "main", "main.c", Some(at(12)))
            .await
            .unwrap();
        assert_eq!(rev.id, "r1");
        assert_eq!(resolver.host().pages_served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_late_revision_is_too_late() {
        let host = MemoryHost::new().commit("only", 100, &[("main.c", "x")]);
        let err = resolve_at(host, 50).await.unwrap_err();
        assert!(err.is_too_late());
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let resolver = CommitResolver::new(three_commits(), HistoryOrdering::Monotonic);
        let err = resolver
            .resolve(&repo(), "main", "nope.c", Some(at(25)))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound { .. }), "{err:?}");

        let err = resolver
            .resolve(&repo(), "ghost-branch", "main.c", Some(at(25)))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn directory_resolves_to_latest_change_under_it() {
        let host = MemoryHost::new()
            .commit("a", 10, &[("hw/main.c", "1")])
            .commit("b", 20, &[("hw/util.h", "2")])
            .commit("c", 30, &[("README.md", "3")]);
        assert_eq!(
            CommitResolver::new(host, HistoryOrdering::Monotonic)
                .resolve(&repo(), "main", "hw", Some(at(35)))
                .await
                .unwrap()
                .id,
            "b"
        );
    }

    #[tokio::test]
    async fn unordered_history_scans_everything() {
        // listed newest first, but "c" carries a skewed (older) commit time
        let host = || {
            MemoryHost::new()
                .commit("a", 20, &[("main.c", "1")])
                .commit("b", 40, &[("main.c", "2")])
                .commit("c", 10, &[("main.c", "3")])
                .page_size(1)
        };

        let monotonic = CommitResolver::new(host(), HistoryOrdering::Monotonic);
        let rev = monotonic
            .resolve(&repo(), "main", "main.c", Some(at(30)))
            .await
            .unwrap();
        assert_eq!(rev.id, "c");
        assert_eq!(monotonic.host().pages_served.load(Ordering::SeqCst), 1);

        let unordered = CommitResolver::new(host(), HistoryOrdering::Unordered);
        let rev = unordered
            .resolve(&repo(), "main", "main.c", Some(at(30)))
            .await
            .unwrap();
        assert_eq!(rev.id, "a");
        assert_eq!(unordered.host().pages_served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_cutoff_uses_branch_head() {
        let resolver = CommitResolver::new(three_commits(), HistoryOrdering::Monotonic);
        let branch = resolver.branch(&repo(), None).await.unwrap();
        assert_eq!(branch, "main");
        let rev = resolver
            .resolve(&repo(), &branch, "main.c", None)
            .await
            .unwrap();
        assert_eq!(rev.id, "r3");
    }
}
