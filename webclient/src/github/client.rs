use ::async_trait::async_trait;
use ::std::time::Duration;
use serde::Deserialize;

use super::urls::*;
use crate::{
    error::*,
    http::{self, RetryPolicy, UrlGlob},
    model::*,
    util,
};

//---------------------------------------------------------
// REST payloads (only the fields we read)

#[derive(Debug, Deserialize)]
struct RepoPayload {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct BranchPayload {
    commit: CommitPayload,
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    committer: Option<Signature>,
    author: Option<Signature>,
}

#[derive(Debug, Deserialize)]
struct Signature {
    date: UtcDateTime,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsPayload {
    Listing(Vec<serde_json::Value>),
    Entry {
        #[serde(rename = "type")]
        kind: String,
    },
}

#[derive(Debug, Deserialize)]
struct TreePayload {
    tree: Vec<TreeItemPayload>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItemPayload {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    size: Option<u64>,
}

impl CommitPayload {
    fn into_revision(self, requested_url: &Url) -> Result<Revision> {
        let date = self
            .commit
            .committer
            .or(self.commit.author)
            .map(|s| s.date)
            .ok_or_else(|| Error::MalformedResponse {
                requested_url: requested_url.to_string(),
                reason: format!("commit {} has no committer date", self.sha),
            })?;
        Ok(Revision::new(self.sha, date))
    }
}

//---------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitHubOptions {
    pub api_base: Url,
    pub raw_base: Url,
    pub token: Option<String>,
    pub retry: RetryPolicy,
    /// Minimum spacing between two requests to the API host.
    pub api_interval: Duration,
}

impl GitHubOptions {
    pub fn new(token: Option<String>) -> Result<Self> {
        Ok(Self {
            api_base: util::parse_url(DEFAULT_API_BASE)?,
            raw_base: util::parse_url(DEFAULT_RAW_BASE)?,
            token,
            retry: RetryPolicy::default(),
            api_interval: Duration::from_millis(50),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: http::Client,
    api_base: Url,
    raw_base: Url,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        Self::with_options(GitHubOptions::new(token)?)
    }

    pub fn with_options(opts: GitHubOptions) -> Result<Self> {
        let api_glob = format!("{}*", UrlGlob::escape(opts.api_base.as_str()));
        let intervals = UrlGlob::new(&api_glob)
            .ok()
            .map(|pat| (pat, opts.api_interval));
        if opts.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            log::info!("No GitHub token given; anonymous requests are heavily rate limited");
        }
        Ok(Self {
            http: http::Client::new(intervals, opts.token, opts.retry)?,
            api_base: opts.api_base,
            raw_base: opts.raw_base,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.http.is_authenticated()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let resp = self.http.get(url.clone(), ACCEPT_JSON).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl RevisionHost for GitHubClient {
    async fn default_branch(&self, repo: &Repo) -> Result<String> {
        let url = repo_url(&self.api_base, repo)?;
        let payload: RepoPayload = self.get_json(url).await?;
        Ok(payload.default_branch)
    }

    async fn branch_head(&self, repo: &Repo, branch: &str) -> Result<Revision> {
        let url = branch_url(&self.api_base, repo, branch)?;
        let payload: BranchPayload = self.get_json(url.clone()).await?;
        payload.commit.into_revision(&url)
    }

    async fn revision_page(
        &self,
        repo: &Repo,
        branch: &str,
        path: &str,
        cursor: Option<&PageCursor>,
    ) -> Result<RevisionPage> {
        let url = match cursor {
            Some(PageCursor(next)) => util::parse_url(next)?,
            None => commits_url(&self.api_base, repo, branch, path)?,
        };
        log::debug!("GET {}", url);

        let resp = self.http.get(url.clone(), ACCEPT_JSON).await?;
        let next = util::next_link(resp.headers()).map(PageCursor);
        let bytes = resp.bytes().await?;
        let commits: Vec<CommitPayload> = serde_json::from_slice(&bytes)?;

        let revisions = commits
            .into_iter()
            .map(|c| c.into_revision(&url))
            .collect::<Result<Vec<_>>>()?;
        Ok(RevisionPage { revisions, next })
    }

    async fn path_kind(&self, repo: &Repo, path: &str, revision: &str) -> Result<PathKind> {
        if path.is_empty() {
            return Ok(PathKind::Dir);
        }
        let url = contents_url(&self.api_base, repo, path, revision)?;
        match self.get_json::<ContentsPayload>(url).await {
            Ok(ContentsPayload::Listing(_)) => Ok(PathKind::Dir),
            Ok(ContentsPayload::Entry { kind }) if kind == "dir" => Ok(PathKind::Dir),
            Ok(ContentsPayload::Entry { .. }) => Ok(PathKind::File),
            Err(e) if e.is_not_found() => Ok(PathKind::Missing),
            Err(e) => Err(e),
        }
    }

    async fn list_tree(&self, repo: &Repo, revision: &str) -> Result<Vec<TreeEntry>> {
        let url = tree_url(&self.api_base, repo, revision)?;
        let payload: TreePayload = self.get_json(url).await?;
        if payload.truncated {
            log::warn!(
                "Tree listing of {}@{} was truncated by the host; some files may be missing",
                repo,
                revision
            );
        }
        Ok(payload
            .tree
            .into_iter()
            .map(|item| TreeEntry {
                kind: match item.kind.as_str() {
                    "blob" => TreeEntryKind::Blob,
                    "tree" => TreeEntryKind::Tree,
                    _ => TreeEntryKind::Other,
                },
                path: item.path,
                size: item.size,
            })
            .collect())
    }

    async fn fetch_raw(
        &self,
        repo: &Repo,
        path: &str,
        revision: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>> {
        let url = raw_url(&self.raw_base, repo, path, revision)?;
        let mut resp = self.http.get(url.clone(), ACCEPT_RAW).await?;

        let too_large = |size| Error::TooLarge {
            requested_url: url.to_string(),
            size,
            limit: max_bytes,
        };
        if let Some(len) = resp.content_length() {
            if len > max_bytes {
                return Err(too_large(len));
            }
        }

        let mut buf = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 > max_bytes {
                return Err(too_large(buf.len() as u64));
            }
        }
        Ok(buf)
    }
}
