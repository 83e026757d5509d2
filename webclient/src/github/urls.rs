use crate::{error::*, model::*, util};

pub const DEFAULT_API_BASE: &str = "https://api.github.com/";
pub const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com/";

pub const ACCEPT_JSON: &str = "application/vnd.github+json";
pub const ACCEPT_RAW: &str = "application/vnd.github.v3.raw";

/// Commits returned per history page; the API maximum.
pub const COMMITS_PER_PAGE: u32 = 100;

pub(super) fn repo_url(api: &Url, repo: &Repo) -> Result<Url> {
    util::join_segments(api, ["repos", &repo.owner, &repo.name])
}

pub(super) fn branch_url(api: &Url, repo: &Repo, branch: &str) -> Result<Url> {
    util::join_segments(api, ["repos", &repo.owner, &repo.name, "branches", branch])
}

pub(super) fn commits_url(api: &Url, repo: &Repo, branch: &str, path: &str) -> Result<Url> {
    let mut url = util::join_segments(api, ["repos", &repo.owner, &repo.name, "commits"])?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("sha", branch);
        if !path.is_empty() {
            q.append_pair("path", path);
        }
        q.append_pair("per_page", &COMMITS_PER_PAGE.to_string());
    }
    Ok(url)
}

pub(super) fn contents_url(api: &Url, repo: &Repo, path: &str, revision: &str) -> Result<Url> {
    let segments = ["repos", &repo.owner, &repo.name, "contents"]
        .into_iter()
        .chain(path.split('/'));
    let mut url = util::join_segments(api, segments)?;
    url.query_pairs_mut().append_pair("ref", revision);
    Ok(url)
}

pub(super) fn tree_url(api: &Url, repo: &Repo, revision: &str) -> Result<Url> {
    let mut url = util::join_segments(
        api,
        ["repos", &repo.owner, &repo.name, "git", "trees", revision],
    )?;
    url.query_pairs_mut().append_pair("recursive", "1");
    Ok(url)
}

pub(super) fn raw_url(raw: &Url, repo: &Repo, path: &str, revision: &str) -> Result<Url> {
    let segments = [repo.owner.as_str(), repo.name.as_str(), revision]
        .into_iter()
        .chain(path.split('/'));
    util::join_segments(raw, segments)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_commits_url() {
        let api = Url::parse(DEFAULT_API_BASE).unwrap();
        let url = commits_url(&api, &Repo::new("a", "b"), "main", "hw 1/main.c").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/a/b/commits?sha=main&path=hw+1%2Fmain.c&per_page=100"
        );
    }

    #[test]
    fn test_raw_url() {
        let raw = Url::parse(DEFAULT_RAW_BASE).unwrap();
        let url = raw_url(&raw, &Repo::new("a", "b"), "src/과제.c", "abc123").unwrap();
        assert_eq!(
            url.as_str(),
            "https://raw.githubusercontent.com/a/b/abc123/src/%EA%B3%BC%EC%A0%9C.c"
        );
    }

    #[test]
    fn should_keep_base_path_prefix() {
        let api = Url::parse("http://127.0.0.1:9000/api/v3").unwrap();
        let url = tree_url(&api, &Repo::new("a", "b"), "sha").unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9000/api/v3/repos/a/b/git/trees/sha?recursive=1"
        );
    }
}
