use ::lazy_regex::{lazy_regex, Lazy, Regex};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::Repo;
use crate::util;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Unrecognized GitHub URL: '{0}'")]
    Unrecognized(String),

    #[error("Unsupported GitHub URL shape: '{0}'")]
    UnsupportedShape(String),
}

static RE_BLOB: Lazy<Regex> =
    lazy_regex!(r"(?i)^https?://github\.com/([^/]+)/([^/]+)/blob/([^/]+)/(.+)$");
static RE_RAW: Lazy<Regex> =
    lazy_regex!(r"(?i)^https?://raw\.githubusercontent\.com/([^/]+)/([^/]+)/([^/]+)/(.+)$");
static RE_TREE: Lazy<Regex> =
    lazy_regex!(r"(?i)^https?://github\.com/([^/]+)/([^/]+)/tree/([^/]+)(?:/(.*))?$");
static RE_REPO: Lazy<Regex> = lazy_regex!(r"(?i)^https?://github\.com/([^/]+)/([^/]+)/?$");

const SCP_PREFIX: &str = "git@github.com:";

/// Where a submission lives: repository, optional branch and a path inside
/// it (empty for the repository root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub repo: Repo,
    pub branch: Option<String>,
    pub path: String,
}

impl RepoRef {
    pub fn new(repo: Repo, branch: Option<String>, path: impl Into<String>) -> Self {
        Self {
            repo,
            branch,
            path: path.into().trim_matches('/').to_owned(),
        }
    }

    /// Parse a submitted GitHub URL.
    ///
    /// ```
    /// use cgrade_webclient::{Repo, RepoRef};
    ///
    /// let r = RepoRef::parse("https://github.com/alice/hw1/blob/main/src/main.c").unwrap();
    /// assert_eq!(r.repo, Repo::new("alice", "hw1"));
    /// assert_eq!(r.branch.as_deref(), Some("main"));
    /// assert_eq!(r.path, "src/main.c");
    ///
    /// let r = RepoRef::parse("git@github.com:alice/hw1.git").unwrap();
    /// assert_eq!(r.branch, None);
    /// assert_eq!(r.path, "");
    /// ```
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let absolute = Self::complete_scheme(url);

        let Ok(parsed) = reqwest::Url::parse(&absolute) else {
            return Err(Error::Unrecognized(url.to_owned()));
        };
        let scheme = parsed.scheme().to_ascii_lowercase();
        let host = match parsed.host_str().map(str::to_ascii_lowercase) {
            Some(h) if h == "www.github.com" => "github.com".to_owned(),
            Some(h) => h,
            None => return Err(Error::Unrecognized(url.to_owned())),
        };
        let clean = format!("{}://{}{}", scheme, host, parsed.path());
        let clean = clean.strip_suffix(".git").unwrap_or(&clean);

        let to_ref = |owner: &str, repo: &str, branch: Option<&str>, path: Option<&str>| {
            Self::new(
                Repo::new(util::percent_decode(owner), util::percent_decode(repo)),
                branch.map(util::percent_decode),
                util::percent_decode(path.unwrap_or("")),
            )
        };

        for re in [&*RE_BLOB, &*RE_RAW] {
            if let Some(c) = re.captures(clean) {
                return Ok(to_ref(&c[1], &c[2], Some(&c[3]), Some(&c[4])));
            }
        }
        if let Some(c) = RE_TREE.captures(clean) {
            return Ok(to_ref(
                &c[1],
                &c[2],
                Some(&c[3]),
                c.get(4).map(|m| m.as_str()),
            ));
        }
        if let Some(c) = RE_REPO.captures(clean) {
            return Ok(to_ref(&c[1], &c[2], None, None));
        }

        if host == "github.com" || host == "raw.githubusercontent.com" {
            Err(Error::UnsupportedShape(url.to_owned()))
        } else {
            Err(Error::Unrecognized(url.to_owned()))
        }
    }

    fn complete_scheme(url: &str) -> String {
        if let Some(owner_repo) = url.strip_prefix(SCP_PREFIX) {
            return format!("https://github.com/{}", owner_repo);
        }
        if url.contains("://") {
            return url.to_owned();
        }
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("www.github.com/")
            || lower.starts_with("github.com/")
            || lower.starts_with("raw.githubusercontent.com/")
        {
            return format!("https://{}", url);
        }
        url.to_owned()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

impl FromStr for RepoRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.repo)?;
        if let Some(branch) = &self.branch {
            write!(f, "@{}", branch)?;
        }
        if !self.path.is_empty() {
            write!(f, ":{}", self.path)?;
        }
        Ok(())
    }
}
