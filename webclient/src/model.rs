use crate::error::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub mod repo_ref;
pub use repo_ref::RepoRef;

pub use reqwest::Url;

pub type UtcDateTime = chrono::DateTime<chrono::Utc>;

/// `owner/name` of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    pub owner: String,
    pub name: String,
}

impl Repo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// One entry of a revision history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub committed_at: UtcDateTime,
}

impl Revision {
    pub fn new(id: impl Into<String>, committed_at: UtcDateTime) -> Self {
        Self {
            id: id.into(),
            committed_at,
        }
    }
}

/// Opaque continuation token handed back by [`RevisionHost::revision_page`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RevisionPage {
    /// Newest first, as delivered by the host.
    pub revisions: Vec<Revision>,
    pub next: Option<PageCursor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PathKind {
    File,
    Dir,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeEntryKind {
    Blob,
    Tree,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub kind: TreeEntryKind,
    pub size: Option<u64>,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            kind: TreeEntryKind::Blob,
            size: Some(size),
        }
    }
}

/// Read access to a code host: revision history of a path and file contents
/// at a given revision.
#[async_trait]
pub trait RevisionHost: Send + Sync {
    async fn default_branch(&self, repo: &Repo) -> Result<String>;

    async fn branch_head(&self, repo: &Repo, branch: &str) -> Result<Revision>;

    /// One page of the history of `path` (the whole repository when empty)
    /// on `branch`. `cursor` is `None` for the first page.
    async fn revision_page(
        &self,
        repo: &Repo,
        branch: &str,
        path: &str,
        cursor: Option<&PageCursor>,
    ) -> Result<RevisionPage>;

    async fn path_kind(&self, repo: &Repo, path: &str, revision: &str) -> Result<PathKind>;

    async fn list_tree(&self, repo: &Repo, revision: &str) -> Result<Vec<TreeEntry>>;

    /// Raw bytes of `path` at `revision`. Fails with [`Error::TooLarge`]
    /// when the content exceeds `max_bytes`.
    async fn fetch_raw(
        &self,
        repo: &Repo,
        path: &str,
        revision: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>>;
}

#[async_trait]
impl<H> RevisionHost for std::sync::Arc<H>
where
    H: RevisionHost + ?Sized,
{
    async fn default_branch(&self, repo: &Repo) -> Result<String> {
        (**self).default_branch(repo).await
    }

    async fn branch_head(&self, repo: &Repo, branch: &str) -> Result<Revision> {
        (**self).branch_head(repo, branch).await
    }

    async fn revision_page(
        &self,
        repo: &Repo,
        branch: &str,
        path: &str,
        cursor: Option<&PageCursor>,
    ) -> Result<RevisionPage> {
        (**self).revision_page(repo, branch, path, cursor).await
    }

    async fn path_kind(&self, repo: &Repo, path: &str, revision: &str) -> Result<PathKind> {
        (**self).path_kind(repo, path, revision).await
    }

    async fn list_tree(&self, repo: &Repo, revision: &str) -> Result<Vec<TreeEntry>> {
        (**self).list_tree(repo, revision).await
    }

    async fn fetch_raw(
        &self,
        repo: &Repo,
        path: &str,
        revision: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>> {
        (**self).fetch_raw(repo, path, revision, max_bytes).await
    }
}

#[async_trait]
impl<H> RevisionHost for &H
where
    H: RevisionHost + ?Sized,
{
    async fn default_branch(&self, repo: &Repo) -> Result<String> {
        (**self).default_branch(repo).await
    }

    async fn branch_head(&self, repo: &Repo, branch: &str) -> Result<Revision> {
        (**self).branch_head(repo, branch).await
    }

    async fn revision_page(
        &self,
        repo: &Repo,
        branch: &str,
        path: &str,
        cursor: Option<&PageCursor>,
    ) -> Result<RevisionPage> {
        (**self).revision_page(repo, branch, path, cursor).await
    }

    async fn path_kind(&self, repo: &Repo, path: &str, revision: &str) -> Result<PathKind> {
        (**self).path_kind(repo, path, revision).await
    }

    async fn list_tree(&self, repo: &Repo, revision: &str) -> Result<Vec<TreeEntry>> {
        (**self).list_tree(repo, revision).await
    }

    async fn fetch_raw(
        &self,
        repo: &Repo,
        path: &str,
        revision: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>> {
        (**self).fetch_raw(repo, path, revision, max_bytes).await
    }
}
