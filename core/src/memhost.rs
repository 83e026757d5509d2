//! In-memory [`RevisionHost`] used by the unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cgrade_webclient::*;
use chrono::TimeZone;

#[derive(Debug, Clone)]
struct Commit {
    revision: Revision,
    touched: Vec<String>,
    snapshot: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
pub struct MemoryHost {
    default_branch: String,
    page_size: usize,
    /// Oldest first.
    commits: Vec<Commit>,
    broken_files: HashSet<String>,
    panicking_files: HashSet<String>,
    pub pages_served: AtomicUsize,
}

pub fn at(secs: i64) -> UtcDateTime {
    chrono::Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn repo() -> Repo {
    Repo::new("alice", "hw")
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            default_branch: "main".into(),
            page_size: 100,
            commits: Vec::new(),
            broken_files: HashSet::new(),
            panicking_files: HashSet::new(),
            pages_served: AtomicUsize::new(0),
        }
    }

    pub fn page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    /// Record a commit on top of the previous snapshot.
    pub fn commit(mut self, id: &str, time: i64, files: &[(&str, &str)]) -> Self {
        let mut snapshot = self
            .commits
            .last()
            .map(|c| c.snapshot.clone())
            .unwrap_or_default();
        for (path, body) in files {
            snapshot.insert(path.to_string(), body.as_bytes().to_vec());
        }
        self.commits.push(Commit {
            revision: Revision::new(id, at(time)),
            touched: files.iter().map(|(p, _)| p.to_string()).collect(),
            snapshot,
        });
        self
    }

    /// Raw fetches of `path` fail with a server error.
    pub fn break_file(mut self, path: &str) -> Self {
        self.broken_files.insert(path.to_owned());
        self
    }

    /// Raw fetches of `path` panic.
    pub fn panic_on_file(mut self, path: &str) -> Self {
        self.panicking_files.insert(path.to_owned());
        self
    }

    fn snapshot(&self, revision: &str) -> Result<&BTreeMap<String, Vec<u8>>> {
        self.commits
            .iter()
            .find(|c| c.revision.id == revision)
            .map(|c| &c.snapshot)
            .ok_or_else(|| not_found(revision))
    }
}

fn not_found(what: &str) -> Error {
    Error::NotFound {
        requested_url: format!("mem://{}", what),
    }
}

fn under(path: &str, prefix: &str) -> bool {
    prefix.is_empty() || path == prefix || path.starts_with(&format!("{}/", prefix))
}

#[async_trait]
impl RevisionHost for MemoryHost {
    async fn default_branch(&self, _repo: &Repo) -> Result<String> {
        Ok(self.default_branch.clone())
    }

    async fn branch_head(&self, _repo: &Repo, branch: &str) -> Result<Revision> {
        if branch != self.default_branch {
            return Err(not_found(branch));
        }
        self.commits
            .last()
            .map(|c| c.revision.clone())
            .ok_or_else(|| not_found(branch))
    }

    async fn revision_page(
        &self,
        _repo: &Repo,
        branch: &str,
        path: &str,
        cursor: Option<&PageCursor>,
    ) -> Result<RevisionPage> {
        if branch != self.default_branch {
            return Err(not_found(branch));
        }
        self.pages_served.fetch_add(1, Ordering::SeqCst);

        let history: Vec<_> = self
            .commits
            .iter()
            .rev()
            .filter(|c| c.touched.iter().any(|t| under(t, path)))
            .map(|c| c.revision.clone())
            .collect();
        let start = cursor.and_then(|c| c.0.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(history.len());
        Ok(RevisionPage {
            revisions: history.get(start..end).unwrap_or_default().to_vec(),
            next: (end < history.len()).then(|| PageCursor(end.to_string())),
        })
    }

    async fn path_kind(&self, _repo: &Repo, path: &str, revision: &str) -> Result<PathKind> {
        let snapshot = self.snapshot(revision)?;
        if path.is_empty() {
            return Ok(PathKind::Dir);
        }
        if snapshot.contains_key(path) {
            return Ok(PathKind::File);
        }
        if snapshot.keys().any(|k| under(k, path)) {
            return Ok(PathKind::Dir);
        }
        Ok(PathKind::Missing)
    }

    async fn list_tree(&self, _repo: &Repo, revision: &str) -> Result<Vec<TreeEntry>> {
        let snapshot = self.snapshot(revision)?;
        Ok(snapshot
            .iter()
            .map(|(path, body)| TreeEntry::blob(path.clone(), body.len() as u64))
            .collect())
    }

    async fn fetch_raw(
        &self,
        _repo: &Repo,
        path: &str,
        revision: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>> {
        if self.panicking_files.contains(path) {
            panic!("host blew up fetching {}", path);
        }
        if self.broken_files.contains(path) {
            return Err(Error::UnexpectedResponseCode {
                got: http::StatusCode::INTERNAL_SERVER_ERROR,
                requested_url: format!("mem://{}/{}", revision, path),
            });
        }
        let body = self
            .snapshot(revision)?
            .get(path)
            .ok_or_else(|| not_found(path))?;
        if body.len() as u64 > max_bytes {
            return Err(Error::TooLarge {
                requested_url: format!("mem://{}/{}", revision, path),
                size: body.len() as u64,
                limit: max_bytes,
            });
        }
        Ok(body.clone())
    }
}
