use std::path::{Path, PathBuf};
use std::result::Result as StdResult;
use std::time::Duration;

use anyhow::Context as _;
use rust_embed::RustEmbed;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    pub source_config_file: Option<PathBuf>,
    pub fetch: FetchConfig,
    pub compile: CompileConfig,
    pub run: RunConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StageScope {
    #[default]
    Repo,
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HistoryOrdering {
    /// Newest first as delivered; the first eligible entry wins.
    #[default]
    Monotonic,
    /// No ordering assumed; every page is scanned.
    Unordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Rlimit,
    Nsjail,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub data_root: PathBuf,
    pub main_name: String,
    pub keep_original: bool,
    pub force_rename: bool,
    pub scope: StageScope,
    pub preserve_subdirs: bool,
    pub max_file_bytes: u64,
    pub history_ordering: HistoryOrdering,
    pub request_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    pub compiler: PathBuf,
    pub flags: Vec<String>,
    pub libs: Vec<String>,
    pub timeout_secs: f64,
    pub diagnostics_max_bytes: usize,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub sandbox: SandboxKind,
    pub nsjail_path: PathBuf,
    pub nsjail_cgroups: bool,
    pub wall_time_secs: f64,
    pub cpu_time_secs: f64,
    pub memory_mb: u64,
    pub max_processes: u64,
    pub max_file_bytes: u64,
    pub max_open_files: u64,
    /// Total size of everything a program may leave in its scratch directory.
    pub scratch_max_bytes: u64,
    pub stdout_max_bytes: usize,
    pub stderr_max_bytes: usize,
    pub isolate_network: bool,
    pub parallelism: usize,
    pub scratch_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub dir: PathBuf,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            data_root: "./submissions".into(),
            main_name: "main.c".into(),
            keep_original: false,
            force_rename: false,
            scope: StageScope::Repo,
            preserve_subdirs: true,
            max_file_bytes: 1 << 20,
            history_ordering: HistoryOrdering::Monotonic,
            request_interval_ms: 50,
        }
    }
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            compiler: "gcc".into(),
            flags: ["-O2", "-std=c17", "-Wall", "-Wextra"]
                .map(String::from)
                .to_vec(),
            libs: vec!["-lm".into()],
            timeout_secs: 30.0,
            diagnostics_max_bytes: 16 * 1024,
            recursive: true,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxKind::Rlimit,
            nsjail_path: "nsjail".into(),
            nsjail_cgroups: true,
            wall_time_secs: 2.0,
            cpu_time_secs: 2.0,
            memory_mb: 256,
            max_processes: 32,
            max_file_bytes: 16 << 20,
            max_open_files: 64,
            scratch_max_bytes: 64 << 20,
            stdout_max_bytes: 64 * 1024,
            stderr_max_bytes: 16 * 1024,
            isolate_network: true,
            parallelism: 4,
            scratch_root: PathBuf::new(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: "./reports".into(),
        }
    }
}

impl CompileConfig {
    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_secs)
    }
}

impl RunConfig {
    pub fn wall_time(&self) -> Duration {
        secs_to_duration(self.wall_time_secs)
    }

    pub fn cpu_time(&self) -> Duration {
        secs_to_duration(self.cpu_time_secs)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1 << 20)
    }

    pub fn scratch_root(&self) -> PathBuf {
        if self.scratch_root.as_os_str().is_empty() {
            std::env::temp_dir()
        } else {
            self.scratch_root.clone()
        }
    }
}

impl FetchConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// Credentials and endpoint overrides read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HostEnv {
    pub github_token: Option<String>,
    pub cgrade_api_base: Option<String>,
    pub cgrade_raw_base: Option<String>,
}

impl HostEnv {
    pub fn from_env() -> anyhow::Result<Self> {
        envy::from_env::<Self>().context("Invalid host settings in environment")
    }
}

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Asset;

impl Config {
    pub const FILENAME: &str = "cgrade.toml";

    pub fn example_toml() -> String {
        Asset::get(Self::FILENAME)
            .map(|file| String::from_utf8_lossy(file.data.as_ref()).into_owned())
            .unwrap_or_default()
    }

    pub fn from_toml(s: &str) -> StdResult<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(filepath: PathBuf) -> anyhow::Result<Self> {
        let toml = fsutil::read_to_string(&filepath).context("Cannot read a file")?;
        let mut cfg = Self::from_toml(&toml)
            .with_context(|| format!("Invalid config TOML: {:?}", filepath))?;
        cfg.source_config_file = Some(filepath);
        cfg.resolve_relative_paths();
        Ok(cfg)
    }

    /// Find config file ancestor dirs, including current dir.
    pub fn find_file_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let cur_dir = cur_dir.as_ref();
        cur_dir
            .ancestors()
            .map(|dir| dir.join(Self::FILENAME))
            .find(|path| path.is_file())
            .with_context(|| format!("Cannot find '{}' in {:?} or its ancestors", Self::FILENAME, cur_dir))
    }

    pub fn from_file_finding_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_filepath = Config::find_file_in_ancestors(cur_dir)?;
        Self::from_toml_file(config_filepath)
    }

    /// Like [`Self::from_file_finding_in_ancestors`], falling back to the
    /// defaults when no config file exists.
    pub fn load_or_default(cur_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        match Config::find_file_in_ancestors(&cur_dir) {
            Ok(path) => Self::from_toml_file(path),
            Err(_) => {
                log::info!("No {} found; using built-in defaults", Self::FILENAME);
                Ok(Self::default())
            }
        }
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.source_config_file.as_deref().and_then(Path::parent)
    }

    fn resolve_relative_paths(&mut self) {
        let Some(base) = self.base_dir().map(Path::to_path_buf) else {
            return;
        };
        let fix = |p: &mut PathBuf| {
            if !p.as_os_str().is_empty() && p.is_relative() {
                *p = fsutil::normalize_path(base.join(&*p));
            }
        };
        fix(&mut self.fetch.data_root);
        fix(&mut self.report.dir);
        fix(&mut self.run.scratch_root);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn example_toml_should_equal_defaults() {
        let toml = Config::example_toml();
        assert!(!toml.is_empty());
        let cfg = dbg!(Config::from_toml(&toml)).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn empty_toml_should_be_valid() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.compile.flags, ["-O2", "-std=c17", "-Wall", "-Wextra"]);
        assert_eq!(cfg.run.wall_time(), Duration::from_secs(2));
        assert_eq!(cfg.fetch.history_ordering, HistoryOrdering::Monotonic);
    }

    #[test]
    fn should_override_some_keys() {
        let cfg = Config::from_toml(
            r#"
            [fetch]
            scope = "dir"
            history_ordering = "unordered"

            [run]
            sandbox = "nsjail"
            memory_mb = 64
            "#,
        )
        .unwrap();
        assert_eq!(cfg.fetch.scope, StageScope::Dir);
        assert_eq!(cfg.fetch.history_ordering, HistoryOrdering::Unordered);
        assert_eq!(cfg.run.sandbox, SandboxKind::Nsjail);
        assert_eq!(cfg.run.memory_bytes(), 64 << 20);
        assert_eq!(cfg.fetch.main_name, "main.c");
    }

    #[test]
    fn should_resolve_paths_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fsutil::mkdir_all(&nested).unwrap();
        fsutil::write(dir.path().join(Config::FILENAME), "[report]\ndir = \"out\"\n").unwrap();

        let cfg = Config::from_file_finding_in_ancestors(&nested).unwrap();
        assert_eq!(cfg.report.dir, dir.path().join("out"));
        assert_eq!(cfg.fetch.data_root, dir.path().join("submissions"));
    }
}
