pub mod error {
    #[allow(unused_imports)]
    pub(crate) use anyhow::{anyhow, bail, ensure, Context as _};
    pub use anyhow::{Error, Result};
}
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cgrade_webclient::github::GitHubOptions;
use cgrade_webclient::{GitHubClient, RepoRef, RevisionHost, Url, UtcDateTime};
use colored::Colorize;
use error::*;
use fsutil::WalkOpt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::Mutex;

use crate::config::{Config, HostEnv};
use crate::grader::Grader;
use crate::report::{ReportStore, SuiteSummary};
use crate::resolve::CommitResolver;
use crate::stage::{self, SourceMaterializer, StageRequest, StagedSubmission};
use crate::style;
use crate::submission::{Submission, SubmissionList};
use crate::testing::{judge, CompileError, CompileStage, ExecutionStage, TestSuite, TestVerdict};

/// Writes the example config into `dir`. Never overwrites an existing one.
pub fn init_config(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let path = dir.as_ref().join(Config::FILENAME);
    match fsutil::write_new_atomic(&path, Config::example_toml()) {
        Ok(()) => Ok(path),
        Err(fsutil::Error::AlreadyExists(p)) => bail!("{:?} already exists", p),
        Err(e) => Err(e).context("Failed to write example config"),
    }
}

pub fn github_client(cfg: &Config, env: &HostEnv) -> Result<GitHubClient> {
    let mut opts = GitHubOptions::new(env.github_token.clone())?;
    if let Some(base) = &env.cgrade_api_base {
        opts.api_base = Url::parse(base).with_context(|| format!("Invalid API base URL: {}", base))?;
    }
    if let Some(base) = &env.cgrade_raw_base {
        opts.raw_base = Url::parse(base).with_context(|| format!("Invalid raw base URL: {}", base))?;
    }
    opts.api_interval = cfg.fetch.request_interval();
    GitHubClient::with_options(opts).context("Failed to set up GitHub client")
}

/// Fails when the configured compiler cannot even report its version.
pub async fn probe_toolchain(cfg: &Config) -> Result<String> {
    let version = CompileStage::from_config(&cfg.compile)
        .probe()
        .await
        .context("Toolchain is unavailable")?;
    log::info!("Using {}", version);
    Ok(version)
}

/// Resolve and stage one submission into `<data_root>/<id>` without building it.
pub async fn fetch_submission<H: RevisionHost + Clone>(
    host: H,
    cfg: &Config,
    sub: &Submission,
    cutoff: Option<UtcDateTime>,
) -> Result<StagedSubmission> {
    let location = RepoRef::parse(&sub.url).with_context(|| format!("[{}] Unusable URL", sub.id))?;

    let resolver = CommitResolver::new(host.clone(), cfg.fetch.history_ordering);
    let branch = resolver
        .branch(&location.repo, location.branch.as_deref())
        .await
        .with_context(|| format!("[{}] Failed to find branch", sub.id))?;
    let revision = resolver
        .resolve(&location.repo, &branch, &location.path, cutoff)
        .await
        .with_context(|| format!("[{}] Failed to resolve revision", sub.id))?;
    log::info!("[{}] {} @ {}", sub.id, location, revision.id);

    let req = StageRequest {
        url: &sub.url,
        location: &location,
        branch: &branch,
        revision: &revision,
    };
    SourceMaterializer::new(host, cfg.fetch.clone())
        .materialize(req, &cfg.fetch.data_root.join(&sub.id))
        .await
        .with_context(|| format!("[{}] Failed to stage sources", sub.id))
}

pub async fn fetch_list<H: RevisionHost + Clone>(
    host: H,
    cfg: &Config,
    list: &SubmissionList,
    cutoff: Option<UtcDateTime>,
) -> Vec<(String, Result<StagedSubmission>)> {
    let mut results = Vec::with_capacity(list.students.len());
    for sub in &list.students {
        let res = self::fetch_submission(host.clone(), cfg, sub, cutoff).await;
        results.push((sub.id.clone(), res));
    }
    results
}

/// Resolves `(source root, main file)` for a local target.
///
/// A file is its own main. A directory is tried as a staged submission first,
/// then for `<main_name>`, then for the single top-level `.c` defining main.
pub fn locate_main(target: &Path, main_name: &str) -> Result<(PathBuf, PathBuf)> {
    if target.is_file() {
        let root = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        return Ok((root, target.to_owned()));
    }
    ensure!(target.is_dir(), "No such file or directory: {:?}", target);

    if let Ok(staged) = StagedSubmission::load(target) {
        let main = staged.main_path();
        return Ok((staged.dir, main));
    }

    let conventional = target.join(main_name);
    if conventional.is_file() {
        return Ok((target.to_owned(), conventional));
    }

    let opt = WalkOpt {
        recursive: false,
        skip_hidden_dirs: true,
    };
    let mut candidates = Vec::new();
    for path in fsutil::find_files_with_ext(target, &["c"], opt)? {
        if stage::defines_main(&fsutil::read(&path)?) {
            candidates.push(path);
        }
    }
    match candidates.len() {
        1 => Ok((target.to_owned(), candidates.remove(0))),
        0 => bail!("No C file defining main in {:?}", target),
        n => bail!("{} C files define main in {:?}; pass one explicitly", n, target),
    }
}

/// Compile one local source tree and run the suite against it, with a spinner per test.
pub async fn run_local(cfg: &Config, suite: &TestSuite, target: &Path) -> Result<Vec<TestVerdict>> {
    ensure!(!suite.is_empty(), "Test suite '{}' has no cases", suite.name);

    let (root, main) = self::locate_main(target, &cfg.fetch.main_name)?;
    let compiler = CompileStage::from_config(&cfg.compile);
    let unit = compiler.collect_sources(&root, &main)?;

    let scratch_root = cfg.run.scratch_root();
    fsutil::mkdir_all(&scratch_root)?;
    let workdir = tempfile::Builder::new()
        .prefix("cgrade-run-")
        .tempdir_in(&scratch_root)
        .with_context(|| format!("Cannot create scratch directory in {:?}", scratch_root))?;

    log::info!("Compiling {}", main.to_string_lossy());
    let compiled = match compiler
        .compile(&unit, &workdir.path().join("build").join("prog"))
        .await
    {
        Ok(c) => c,
        Err(e @ (CompileError::Rejected { .. } | CompileError::TimedOut { .. })) => {
            eprintln!("{}", e.diagnostics());
            return Err(e).context("Compilation failed");
        }
        Err(e) => return Err(e).context("Cannot run the compiler"),
    };
    if !compiled.diagnostics.trim().is_empty() {
        log::warn!("Compiler output:\n{}", compiled.diagnostics);
    }

    let exec = ExecutionStage::from_config(cfg);
    let style = ProgressStyle::default_bar().template("{spinner} {msg}")?;

    let mut verdicts = Vec::with_capacity(suite.len());
    let mut bars = Vec::with_capacity(suite.len());
    let progress_bar_container = MultiProgress::new();

    for case in &suite.cases {
        let bar = progress_bar_container
            .add(ProgressBar::new(100))
            .with_style(style.clone())
            .with_message(format!("Test {} ...", case.name));
        let bar = Arc::new(Mutex::new(bar));
        bars.push(bar.clone());

        // Tick spinner
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let bar = bar.lock().await;
                if bar.is_finished() {
                    break;
                }
                bar.tick();
            }
        });
    }

    for (i, (case, bar)) in suite.cases.iter().zip(&bars).enumerate() {
        let scratch = workdir.path().join(format!("t{:03}", i + 1));
        let outcome = match exec
            .run(&compiled.artifact, &scratch, case.stdin.as_bytes())
            .await
        {
            Ok(o) => o,
            Err(e) => {
                for bar in &bars {
                    bar.lock().await.abandon();
                }
                return Err(e).with_context(|| format!("Cannot run test {}", case.name));
            }
        };
        let verdict = judge(case, outcome);
        bar.lock()
            .await
            .finish_with_message(style::verdict_line(&verdict).cyan().to_string());
        verdicts.push(verdict);
    }
    println!();

    suite
        .cases
        .iter()
        .zip(&verdicts)
        .filter(|(_, v)| !v.passed)
        .for_each(|(case, v)| style::print_verdict_detail(v, case));

    style::print_run_summary(&verdicts);
    Ok(verdicts)
}

/// Grade a whole list, persist every report plus `summary.json`, and
/// return the run's store together with its summary.
pub async fn grade_submissions<H>(
    host: H,
    cfg: &Config,
    suite: TestSuite,
    list: &SubmissionList,
    cutoff: Option<UtcDateTime>,
) -> Result<(ReportStore, SuiteSummary)>
where
    H: RevisionHost + Clone + 'static,
{
    ensure!(!suite.is_empty(), "Test suite '{}' has no cases", suite.name);
    self::probe_toolchain(cfg).await?;

    let store = ReportStore::for_new_run(&cfg.report.dir, &suite.name, chrono::Utc::now());
    log::info!("Writing reports to {}", store.dir().to_string_lossy());

    let grader = Arc::new(Grader::new(host, cfg, Arc::new(suite), store.clone()).cutoff(cutoff));

    let bar = ProgressBar::new(list.students.len() as u64).with_style(
        ProgressStyle::default_bar()
            .template("{spinner} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    let reports = grader
        .grade_all(&list.students, |report| {
            bar.inc(1);
            bar.set_message(format!("{}: {}", report.id, report.status));
        })
        .await;
    bar.finish_and_clear();
    log::info!("Graded {} submission(s)", reports.len());

    let roster = list.ids();
    let summary = SuiteSummary::from_store(&store, Some(roster.as_slice()))
        .context("Failed to read back reports")?;
    store
        .put_summary(&summary)
        .context("Failed to write summary")?;
    Ok((store, summary))
}

/// Rebuild the summary of a finished run directory.
pub fn summarize(report_dir: impl AsRef<Path>, roster: Option<&SubmissionList>) -> Result<SuiteSummary> {
    let report_dir = report_dir.as_ref();
    ensure!(report_dir.is_dir(), "No such report directory: {:?}", report_dir);

    let store = ReportStore::new(report_dir);
    let ids = roster.map(SubmissionList::ids);
    let summary = SuiteSummary::from_store(&store, ids.as_deref())
        .with_context(|| format!("Failed to read reports in {:?}", report_dir))?;
    if roster.is_none() && summary.rows.is_empty() {
        bail!("No reports found in {:?}", report_dir);
    }
    Ok(summary)
}
