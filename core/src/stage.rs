use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use ::lazy_regex::{lazy_regex, Lazy, Regex};
use cgrade_webclient::{self as webclient, PathKind, RepoRef, Revision, RevisionHost, TreeEntryKind, UtcDateTime};
use serde::{Deserialize, Serialize};

use crate::config::{FetchConfig, StageScope};

pub const MANIFEST_FILENAME: &str = ".cgrade-stage.json";

static RE_DEFINES_MAIN: Lazy<Regex> = lazy_regex!(r"\bint\s+main\s*\(");

/// Whether a C source defines `int main(`.
pub fn defines_main(src: &[u8]) -> bool {
    RE_DEFINES_MAIN.is_match(&String::from_utf8_lossy(src))
}

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("'{path}' does not exist at revision {revision}")]
    PathMissing { path: String, revision: String },

    #[error("'{path}' is {size} bytes, over the {limit}-byte limit")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error("No C sources under '{scope}'")]
    NoSources { scope: String },

    #[error("Cannot pick a main file under '{scope}': {} candidate(s) define main", candidates.len())]
    NoUniqueMain {
        scope: String,
        candidates: Vec<String>,
    },

    #[error("Failed to retrieve '{path}': {source}")]
    Host {
        path: String,
        #[source]
        source: webclient::Error,
    },

    #[error(transparent)]
    Io(#[from] fsutil::Error),
}

impl FetchError {
    fn from_host(path: &str, e: webclient::Error) -> Self {
        match e {
            webclient::Error::TooLarge { size, limit, .. } => Self::TooLarge {
                path: path.to_owned(),
                size,
                limit,
            },
            e => Self::Host {
                path: path.to_owned(),
                source: e,
            },
        }
    }
}

/// Where a staged file came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub original: String,
    pub staged: String,
    pub bytes: u64,
}

impl StagedFile {
    pub fn is_renamed(&self) -> bool {
        Path::new(&self.original).file_name() != Path::new(&self.staged).file_name()
    }
}

/// Written next to the staged sources so a human can trace every file back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageManifest {
    pub url: String,
    pub repo: String,
    pub branch: String,
    pub path: String,
    pub path_kind: String,
    pub revision: String,
    pub committed_at: UtcDateTime,
    /// Staged path of the designated main source, relative to the stage dir.
    pub main: String,
    pub files: Vec<StagedFile>,
}

#[derive(Debug, Clone)]
pub struct StagedSubmission {
    pub dir: PathBuf,
    pub manifest: StageManifest,
}

impl StagedSubmission {
    pub fn main_path(&self) -> PathBuf {
        self.dir.join(&self.manifest.main)
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let manifest = fsutil::read_json_with_deserialize(dir.join(MANIFEST_FILENAME))?;
        Ok(Self {
            dir: dir.to_owned(),
            manifest,
        })
    }
}

/// A pinned source location to stage.
#[derive(Debug, Clone, Copy)]
pub struct StageRequest<'a> {
    pub url: &'a str,
    pub location: &'a RepoRef,
    pub branch: &'a str,
    pub revision: &'a Revision,
}

#[derive(Debug, Clone)]
struct Planned {
    original: String,
    staged: String,
    size: Option<u64>,
    is_main: bool,
}

/// Copies a submission's sources at a fixed revision into a local directory.
#[derive(Debug, Clone)]
pub struct SourceMaterializer<H> {
    host: H,
    cfg: FetchConfig,
}

impl<H: RevisionHost> SourceMaterializer<H> {
    pub fn new(host: H, cfg: FetchConfig) -> Self {
        Self { host, cfg }
    }

    /// Stage into `dest`, replacing whatever was there.
    pub async fn materialize(&self, req: StageRequest<'_>, dest: &Path) -> Result<StagedSubmission> {
        let repo = &req.location.repo;
        let path = req.location.path.as_str();
        let rev = req.revision.id.as_str();

        let kind = self
            .host
            .path_kind(repo, path, rev)
            .await
            .map_err(|e| FetchError::from_host(path, e))?;
        log::debug!("{}:{} at {} is {}", repo, path, rev, kind);

        let (scope, representative) = match kind {
            PathKind::Missing => {
                return Err(FetchError::PathMissing {
                    path: path.to_owned(),
                    revision: rev.to_owned(),
                })
            }
            PathKind::File => {
                let scope = match self.cfg.scope {
                    StageScope::Repo => "",
                    StageScope::Dir => parent_of(path),
                };
                (scope, Some(path))
            }
            PathKind::Dir => (path, None),
        };

        let tree = self
            .host
            .list_tree(repo, rev)
            .await
            .map_err(|e| FetchError::from_host(path, e))?;
        let mut plan = self.plan(scope, representative, &tree);

        if representative.is_none() {
            if !plan.iter().any(|p| is_c_source(&p.staged)) {
                return Err(FetchError::NoSources {
                    scope: scope.to_owned(),
                });
            }
            let preferred = join_rel(scope, &self.cfg.main_name);
            if let Some(p) = plan.iter_mut().find(|p| p.original == preferred) {
                p.is_main = true;
            }
        }

        if dest.exists() {
            fsutil::remove_dir_all(dest)?;
        }
        fsutil::mkdir_all(dest)?;

        let mut files = Vec::with_capacity(plan.len());
        let mut main_candidates = Vec::new();
        for item in &plan {
            let body = match self.fetch(req, item).await {
                Ok(body) => body,
                Err(e) if item.is_main => return Err(e),
                Err(e) => {
                    log::warn!("Skipping auxiliary file: {}", e);
                    continue;
                }
            };
            if is_c_source(&item.staged) && defines_main(&body) {
                main_candidates.push(item.staged.clone());
            }
            fsutil::write_with_mkdir(fsutil::join_within(dest, &item.staged)?, &body)?;
            files.push(StagedFile {
                original: item.original.clone(),
                staged: item.staged.clone(),
                bytes: body.len() as u64,
            });
        }

        let main = match plan.iter().find(|p| p.is_main) {
            Some(p) => p.staged.clone(),
            None if main_candidates.len() == 1 => main_candidates.remove(0),
            None => {
                return Err(FetchError::NoUniqueMain {
                    scope: scope.to_owned(),
                    candidates: main_candidates,
                })
            }
        };

        let manifest = StageManifest {
            url: req.url.to_owned(),
            repo: repo.to_string(),
            branch: req.branch.to_owned(),
            path: path.to_owned(),
            path_kind: kind.to_string(),
            revision: rev.to_owned(),
            committed_at: req.revision.committed_at,
            main,
            files,
        };
        fsutil::write_json_with_mkdir(dest.join(MANIFEST_FILENAME), &manifest)?;

        Ok(StagedSubmission {
            dir: dest.to_owned(),
            manifest,
        })
    }

    async fn fetch(&self, req: StageRequest<'_>, item: &Planned) -> Result<Vec<u8>> {
        let limit = self.cfg.max_file_bytes;
        if let Some(size) = item.size.filter(|&s| s > limit) {
            return Err(FetchError::TooLarge {
                path: item.original.clone(),
                size,
                limit,
            });
        }
        self.host
            .fetch_raw(&req.location.repo, &item.original, &req.revision.id, limit)
            .await
            .map_err(|e| FetchError::from_host(&item.original, e))
    }

    fn plan(
        &self,
        scope: &str,
        representative: Option<&str>,
        tree: &[webclient::TreeEntry],
    ) -> Vec<Planned> {
        let mut namer = Namer::new(&self.cfg.main_name);
        let mut plan = Vec::new();

        let size_of = |path: &str| tree.iter().find(|e| e.path == path).and_then(|e| e.size);

        let rename_representative = representative
            .map_or(false, |rep| self.cfg.force_rename || !is_c_source(rep));
        if let Some(rep) = representative {
            if rename_representative {
                plan.push(Planned {
                    original: rep.to_owned(),
                    staged: namer.reserve(&self.cfg.main_name),
                    size: size_of(rep),
                    is_main: true,
                });
                let base = file_name(rep);
                if self.cfg.keep_original && base != self.cfg.main_name && is_safe_component(base) {
                    plan.push(Planned {
                        original: rep.to_owned(),
                        staged: namer.reserve(base),
                        size: size_of(rep),
                        is_main: false,
                    });
                }
            }
        }

        let mut seen_representative = false;
        for entry in tree {
            if entry.kind != TreeEntryKind::Blob
                || !(is_c_source(&entry.path) || is_c_header(&entry.path))
                || !is_under(&entry.path, scope)
                || has_hidden_component(&entry.path)
            {
                continue;
            }
            let is_rep = representative == Some(entry.path.as_str());
            seen_representative |= is_rep;
            if is_rep && rename_representative {
                continue;
            }
            plan.push(self.plan_entry(&mut namer, scope, &entry.path, entry.size, is_rep));
        }

        // the representative may sit in a hidden dir or a truncated listing
        if let Some(rep) = representative.filter(|_| !seen_representative && !rename_representative) {
            plan.push(self.plan_entry(&mut namer, scope, rep, size_of(rep), true));
        }
        plan
    }

    fn plan_entry(
        &self,
        namer: &mut Namer,
        scope: &str,
        original: &str,
        size: Option<u64>,
        is_main: bool,
    ) -> Planned {
        let rel = strip_scope(original, scope);
        let rel = if self.cfg.preserve_subdirs {
            rel
        } else {
            file_name(rel)
        };
        Planned {
            original: original.to_owned(),
            staged: namer.stage(rel, is_main),
            size,
            is_main,
        }
    }
}

/// Maps repository paths to safe staged paths.
struct Namer {
    main_name: String,
    used: HashSet<String>,
    dirs: HashMap<String, String>,
    aux_count: usize,
    dir_count: usize,
}

impl Namer {
    fn new(main_name: &str) -> Self {
        Self {
            main_name: main_name.to_owned(),
            used: HashSet::new(),
            dirs: HashMap::new(),
            aux_count: 0,
            dir_count: 0,
        }
    }

    fn stage(&mut self, rel: &str, is_main: bool) -> String {
        let mut parts: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        let file = parts.pop().unwrap_or_default();

        let mut original_prefix = String::new();
        let mut staged_dirs = Vec::with_capacity(parts.len());
        for dir in parts {
            original_prefix.push_str(dir);
            original_prefix.push('/');
            let staged = match self.dirs.get(&original_prefix) {
                Some(s) => s.clone(),
                None => {
                    let s = if is_safe_component(dir) {
                        dir.to_owned()
                    } else {
                        self.dir_count += 1;
                        format!("dir_{}", self.dir_count)
                    };
                    self.dirs.insert(original_prefix.clone(), s.clone());
                    s
                }
            };
            staged_dirs.push(staged);
        }

        let name = if is_safe_component(file) {
            file.to_owned()
        } else if is_main {
            self.main_name.clone()
        } else {
            self.aux_count += 1;
            format!("aux_{}.{}", self.aux_count, extension(file))
        };
        staged_dirs.push(name);
        self.reserve(&staged_dirs.join("/"))
    }

    /// Claim `path`, suffixing the stem when it is already taken.
    fn reserve(&mut self, path: &str) -> String {
        let mut candidate = path.to_owned();
        let (stem, ext) = match path.rsplit_once('.') {
            Some((s, e)) if !s.is_empty() && !s.ends_with('/') => (s, format!(".{}", e)),
            _ => (path, String::new()),
        };
        let mut n = 0;
        while !self.used.insert(candidate.clone()) {
            n += 1;
            candidate = format!("{}_{}{}", stem, n, ext);
        }
        if n > 0 {
            log::warn!("Staged name '{}' already taken; using '{}'", path, candidate);
        }
        candidate
    }
}

/// ASCII letters, digits, `.`, `_` and `-`, not starting with `.` or `-`.
pub fn is_safe_component(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 100
        && !s.starts_with('.')
        && !s.starts_with('-')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_c_source(path: &str) -> bool {
    extension(path).eq_ignore_ascii_case("c")
}

fn is_c_header(path: &str) -> bool {
    extension(path).eq_ignore_ascii_case("h")
}

fn extension(path: &str) -> &str {
    let name = file_name(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn is_under(path: &str, scope: &str) -> bool {
    scope.is_empty() || path == scope || path.starts_with(&format!("{}/", scope))
}

fn strip_scope<'a>(path: &'a str, scope: &str) -> &'a str {
    if scope.is_empty() {
        return path;
    }
    path.strip_prefix(scope)
        .map(|rest| rest.trim_start_matches('/'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or_else(|| file_name(path))
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn has_hidden_component(path: &str) -> bool {
    path.split('/').any(|c| c.starts_with('.'))
}
