//! The grading pipeline: resolve, stage, compile, run, judge, report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cgrade_webclient::{RepoRef, RevisionHost, UtcDateTime};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::config::Config;
use crate::report::{ReportStore, SubmissionReport, SubmissionStatus};
use crate::resolve::CommitResolver;
use crate::stage::{SourceMaterializer, StageRequest};
use crate::submission::Submission;
use crate::testing::{judge, CompileError, CompileStage, ExecutionStage, TestSuite, TestVerdict};

/// Result of compiling and testing one staged source tree.
#[derive(Debug, Clone)]
pub enum Evaluation {
    Graded {
        diagnostics: String,
        verdicts: Vec<TestVerdict>,
    },
    CompileFailed {
        diagnostics: String,
        reason: String,
    },
    LaunchFailed {
        reason: String,
    },
}

/// Compiles a staged tree and runs every test case against it, in order.
/// Needs no revision host.
#[derive(Debug, Clone)]
pub struct TestBench {
    suite: Arc<TestSuite>,
    compiler: CompileStage,
    exec: ExecutionStage,
}

impl TestBench {
    pub fn new(suite: Arc<TestSuite>, compiler: CompileStage, exec: ExecutionStage) -> Self {
        Self {
            suite,
            compiler,
            exec,
        }
    }

    pub fn from_config(cfg: &Config, suite: Arc<TestSuite>) -> Self {
        Self::new(
            suite,
            CompileStage::from_config(&cfg.compile),
            ExecutionStage::from_config(cfg),
        )
    }

    pub fn suite(&self) -> &TestSuite {
        &self.suite
    }

    pub fn compiler(&self) -> &CompileStage {
        &self.compiler
    }

    /// `workdir` must be exclusive to this evaluation: the artifact and one
    /// fresh scratch directory per test case are created inside it.
    pub async fn evaluate(&self, root: &Path, main: &Path, workdir: &Path) -> Evaluation {
        let unit = match self.compiler.collect_sources(root, main) {
            Ok(unit) => unit,
            Err(e) => return Evaluation::LaunchFailed { reason: e.to_string() },
        };
        let artifact = workdir.join("build").join("prog");
        let compiled = match self.compiler.compile(&unit, &artifact).await {
            Ok(c) => c,
            Err(e @ (CompileError::Rejected { .. } | CompileError::TimedOut { .. })) => {
                return Evaluation::CompileFailed {
                    diagnostics: e.diagnostics(),
                    reason: e.to_string(),
                }
            }
            Err(e) => return Evaluation::LaunchFailed { reason: e.to_string() },
        };

        let mut verdicts = Vec::with_capacity(self.suite.len());
        for (i, case) in self.suite.cases.iter().enumerate() {
            let scratch = workdir.join(format!("t{:03}", i + 1));
            let outcome = match self
                .exec
                .run(&compiled.artifact, &scratch, case.stdin.as_bytes())
                .await
            {
                Ok(o) => o,
                Err(e) => return Evaluation::LaunchFailed { reason: e.to_string() },
            };
            verdicts.push(judge(case, outcome));
        }

        Evaluation::Graded {
            diagnostics: compiled.diagnostics,
            verdicts,
        }
    }
}

impl SubmissionReport {
    pub fn with_evaluation(self, evaluation: Evaluation) -> Self {
        match evaluation {
            Evaluation::Graded {
                diagnostics,
                verdicts,
            } => self.graded(diagnostics, verdicts),
            Evaluation::CompileFailed {
                diagnostics,
                reason,
            } => self.compile_failed(diagnostics, reason),
            Evaluation::LaunchFailed { reason } => self.not_run(SubmissionStatus::LaunchFailed, reason),
        }
    }
}

/// Grades a whole submission list against one revision host.
#[derive(Debug)]
pub struct Grader<H> {
    resolver: CommitResolver<H>,
    materializer: SourceMaterializer<H>,
    bench: TestBench,
    store: ReportStore,
    data_root: PathBuf,
    scratch_root: PathBuf,
    cutoff: Option<UtcDateTime>,
    parallelism: usize,
}

impl<H> Grader<H>
where
    H: RevisionHost + Clone + 'static,
{
    pub fn new(host: H, cfg: &Config, suite: Arc<TestSuite>, store: ReportStore) -> Self {
        Self {
            resolver: CommitResolver::new(host.clone(), cfg.fetch.history_ordering),
            materializer: SourceMaterializer::new(host, cfg.fetch.clone()),
            bench: TestBench::from_config(cfg, suite),
            store,
            data_root: cfg.fetch.data_root.clone(),
            scratch_root: cfg.run.scratch_root(),
            cutoff: None,
            parallelism: cfg.run.parallelism.max(1),
        }
    }

    /// Grade the last revision at or before `cutoff` instead of the branch head.
    pub fn cutoff(mut self, cutoff: Option<UtcDateTime>) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    pub fn bench(&self) -> &TestBench {
        &self.bench
    }

    /// Grade every submission, at most `parallelism` at a time, persisting each
    /// report as soon as it is ready. Returned reports are ordered by id.
    pub async fn grade_all<F>(self: &Arc<Self>, submissions: &[Submission], mut on_report: F) -> Vec<SubmissionReport>
    where
        F: FnMut(&SubmissionReport),
    {
        let permits = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();
        for sub in submissions.iter().cloned() {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                this.grade_and_store(&sub).await
            });
        }

        let mut reports = Vec::with_capacity(submissions.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    on_report(&report);
                    reports.push(report);
                }
                Err(e) => log::error!("Grading task died: {}", e),
            }
        }
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    /// Grade on a task of its own, so that a panic anywhere in the pipeline
    /// still yields a `launch-failed` report for `sub`.
    pub async fn grade_and_store(self: &Arc<Self>, sub: &Submission) -> SubmissionReport {
        let worker = {
            let this = Arc::clone(self);
            let sub = sub.clone();
            tokio::spawn(async move { this.grade(&sub).await })
        };
        let report = match worker.await {
            Ok(report) => report,
            Err(e) => {
                log::error!("[{}] Grading task died: {}", sub.id, e);
                SubmissionReport::begin(sub, self.bench.suite())
                    .not_run(SubmissionStatus::LaunchFailed, format!("Grading task died: {}", e))
            }
        };
        if let Err(e) = self.store.put(&report) {
            log::error!("[{}] Cannot store report: {}", sub.id, e);
        }
        report
    }

    /// Never fails: whatever goes wrong ends up in the report.
    pub async fn grade(&self, sub: &Submission) -> SubmissionReport {
        let report = SubmissionReport::begin(sub, self.bench.suite());
        let id = sub.id.as_str();

        let location = match RepoRef::parse(&sub.url) {
            Ok(loc) => loc,
            Err(e) => {
                log::warn!("[{}] {}", id, e);
                return report.not_run(SubmissionStatus::UrlParseFailed, e);
            }
        };

        let branch = match self
            .resolver
            .branch(&location.repo, location.branch.as_deref())
            .await
        {
            Ok(b) => b,
            Err(e) => {
                log::warn!("[{}] {}", id, e);
                return report.not_run(SubmissionStatus::Unresolved, e);
            }
        };

        let revision = match self
            .resolver
            .resolve(&location.repo, &branch, &location.path, self.cutoff)
            .await
        {
            Ok(rev) => rev,
            Err(e) if e.is_too_late() => {
                log::info!("[{}] {}", id, e);
                return report.not_run(SubmissionStatus::TooLate, e);
            }
            Err(e) => {
                log::warn!("[{}] {}", id, e);
                return report.not_run(SubmissionStatus::Unresolved, e);
            }
        };
        log::info!("[{}] {} @ {} ({})", id, location, revision.id, revision.committed_at);
        let report = report.with_revision(revision.clone());

        let req = StageRequest {
            url: &sub.url,
            location: &location,
            branch: &branch,
            revision: &revision,
        };
        let staged = match self
            .materializer
            .materialize(req, &self.data_root.join(id))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[{}] {}", id, e);
                return report.not_run(SubmissionStatus::FetchFailed, e);
            }
        };
        let report = report.with_manifest(staged.manifest.clone());

        let workdir = match tempdir_in(&self.scratch_root, id) {
            Ok(d) => d,
            Err(e) => {
                log::error!("[{}] {:#}", id, e);
                return report.not_run(SubmissionStatus::LaunchFailed, format!("{:#}", e));
            }
        };
        let evaluation = self
            .bench
            .evaluate(&staged.dir, &staged.main_path(), workdir.path())
            .await;
        let report = report.with_evaluation(evaluation);
        log::info!(
            "[{}] {}: {}/{} passed",
            id,
            report.status,
            report.passed,
            report.total
        );
        report
    }
}

fn tempdir_in(root: &Path, id: &str) -> anyhow::Result<tempfile::TempDir> {
    use anyhow::Context as _;

    fsutil::mkdir_all(root)?;
    tempfile::Builder::new()
        .prefix(&format!("cgrade-{}-", id))
        .tempdir_in(root)
        .with_context(|| format!("Cannot create scratch directory in {:?}", root))
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::config::StageScope;
    use crate::memhost::MemoryHost;
    use crate::report::{RowOutcome, SuiteSummary};
    use crate::testing::{Expected, StripMode, TestCase};

    /// Stands in for a C compiler: "compiles" the first source by copying it,
    /// so test submissions are shell scripts.
    const FAKE_CC: &str = r#"#!/bin/sh
out=""; src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -I) shift 2 ;;
    -*) shift ;;
    *) [ -z "$src" ] && src="$1"; shift ;;
  esac
done
if grep -q SYNTAX_ERROR "$src"; then echo "$src:1: error: expected ';'" >&2; exit 1; fi
cp "$src" "$out" && chmod 755 "$out"
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        cfg: Config,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cc = dir.path().join("fake-cc");
        std::fs::write(&cc, FAKE_CC).unwrap();
        std::fs::set_permissions(&cc, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = Config::default();
        cfg.fetch.data_root = dir.path().join("data");
        cfg.fetch.scope = StageScope::Dir;
        cfg.compile.compiler = cc;
        cfg.run.scratch_root = dir.path().join("scratch");
        cfg.run.wall_time_secs = 0.5;
        cfg.run.isolate_network = false;
        cfg.run.max_processes = 4096;
        cfg.run.parallelism = 2;
        Fixture { dir, cfg }
    }

    fn sum_suite() -> Arc<TestSuite> {
        Arc::new(
            TestSuite::new(
                "sum",
                vec![
                    TestCase::new("small", "1 2\n", Expected::One("3\n".into())),
                    TestCase::new("large", "5 5\n", Expected::Any(vec!["10\n".into(), "10".into()])),
                ],
            )
            .unwrap(),
        )
    }

    fn url(path: &str) -> String {
        format!("https://github.com/alice/hw/blob/main/{}", path)
    }

    #[tokio::test]
    async fn should_grade_and_summarize_a_class() {
        let host = Arc::new(
            MemoryHost::new()
                .commit("c1", 10, &[("stu01/main.c", "#!/bin/sh\nSYNTAX_ERROR\n")])
                .commit("c2", 20, &[("stu02/main.c", "#!/bin/sh\nread a b\necho $((a + b))\n")])
                .commit(
                    "c3",
                    30,
                    &[(
                        "stu03/main.c",
                        "#!/bin/sh\nread a b\nif [ \"$a\" = 5 ]; then sleep 5; fi\necho $((a + b))\n",
                    )],
                )
                .commit("c4", 500, &[("stu05/main.c", "#!/bin/sh\necho late\n")]),
        );
        let fx = fixture();
        let store = ReportStore::new(fx.dir.path().join("run"));
        let grader = Arc::new(
            Grader::new(host, &fx.cfg, sum_suite(), store.clone()).cutoff(Some(crate::memhost::at(100))),
        );

        let subs = vec![
            Submission::new("stu03", url("stu03/main.c")),
            Submission::new("stu01", url("stu01/main.c")),
            Submission::new("stu05", url("stu05/main.c")),
            Submission::new("stu02", url("stu02/main.c")),
            Submission::new("stu04", "not a url"),
        ];
        let mut seen = 0;
        let reports = grader.grade_all(&subs, |_| seen += 1).await;
        assert_eq!(seen, 5);

        let ids: Vec<_> = reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["stu01", "stu02", "stu03", "stu04", "stu05"]);

        let stu01 = &reports[0];
        assert_eq!(stu01.status, SubmissionStatus::CompileFailed);
        assert!(stu01.verdicts.is_empty());
        assert!(stu01.compile.as_ref().unwrap().diagnostics.contains("error"));

        let stu03 = &reports[2];
        assert_eq!(stu03.verdicts.len(), 2);
        assert!(stu03.verdicts[0].passed);
        assert!(stu03.verdicts[1].outcome.timed_out());
        assert_eq!(stu03.revision.as_ref().unwrap().id, "c3");

        assert_eq!(reports[3].status, SubmissionStatus::UrlParseFailed);
        assert_eq!(reports[4].status, SubmissionStatus::TooLate);

        let roster: Vec<String> = subs.iter().map(|s| s.id.clone()).collect();
        let summary = SuiteSummary::from_store(&store, Some(&roster)).unwrap();
        let rows: Vec<_> = summary
            .rows
            .iter()
            .map(|r| (r.id.as_str(), r.passed, r.total, r.outcome.clone()))
            .collect();
        assert_eq!(
            rows,
            [
                ("stu01", 0, 2, RowOutcome::CompileFailed),
                ("stu02", 2, 2, RowOutcome::FullPass),
                ("stu03", 1, 2, RowOutcome::Partial),
                (
                    "stu04",
                    0,
                    2,
                    RowOutcome::NotRun {
                        status: SubmissionStatus::UrlParseFailed
                    }
                ),
                (
                    "stu05",
                    0,
                    2,
                    RowOutcome::NotRun {
                        status: SubmissionStatus::TooLate
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_submissions_do_not_see_each_other() {
        let fx = fixture();
        // each program drops a file named after its pid, waits for the other
        // one to do the same, counts what it can see, then reaches for the
        // other's sources and for a process outside its sandbox
        let program = |other: &str| {
            format!(
                "#!/bin/sh\necho hi > \"secret-$$\"\nsleep 0.2\nls -A | wc -l\nls -A \"$TMPDIR\" | wc -l\n\
                 cat {:?} 2>/dev/null || echo hidden\n\
                 read p; kill -9 \"$p\" 2>/dev/null || echo alive\n",
                fx.cfg.fetch.data_root.join(other).join("main.c")
            )
        };
        let (prog_a, prog_b) = (program("b"), program("a"));
        let host = Arc::new(MemoryHost::new().commit(
            "c1",
            10,
            &[("a/main.c", prog_a.as_str()), ("b/main.c", prog_b.as_str())],
        ));

        let mut sleeper = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let suite = Arc::new(
            TestSuite::new(
                "iso",
                vec![TestCase {
                    strip: StripMode::Both,
                    ..TestCase::new(
                        "peek",
                        format!("{}\n", sleeper.id()),
                        Expected::One("1\n1\nhidden\nalive".into()),
                    )
                }],
            )
            .unwrap(),
        );
        let grader = Arc::new(Grader::new(
            host,
            &fx.cfg,
            suite,
            ReportStore::new(fx.dir.path().join("run")),
        ));
        let reports = grader
            .grade_all(
                &[
                    Submission::new("a", url("a/main.c")),
                    Submission::new("b", url("b/main.c")),
                ],
                |_| {},
            )
            .await;

        let still_running = sleeper.try_wait().unwrap().is_none();
        sleeper.kill().unwrap();
        sleeper.wait().unwrap();
        assert!(still_running);

        for r in &reports {
            assert_eq!(r.status, SubmissionStatus::Graded, "{r:?}");
            assert!(r.verdicts[0].passed, "{:?}", r.verdicts[0]);
        }
        let staged_a = fx.cfg.fetch.data_root.join("a");
        let staged_b = fx.cfg.fetch.data_root.join("b");
        assert!(staged_a.join("main.c").is_file());
        assert!(!staged_a.join("b").exists());
        assert!(!staged_b.join("a").exists());

        // scratch space is gone once grading finishes
        let left: Vec<_> = std::fs::read_dir(&fx.cfg.run.scratch_root).unwrap().collect();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn panicking_submission_still_gets_a_report() {
        let host = Arc::new(
            MemoryHost::new()
                .commit("c1", 10, &[("ok/main.c", "#!/bin/sh\nread a b\necho $((a + b))\n")])
                .commit("c2", 20, &[("boom/main.c", "x")])
                .panic_on_file("boom/main.c"),
        );
        let fx = fixture();
        let store = ReportStore::new(fx.dir.path().join("run"));
        let grader = Arc::new(Grader::new(host, &fx.cfg, sum_suite(), store.clone()));
        let mut seen = Vec::new();
        let reports = grader
            .grade_all(
                &[
                    Submission::new("boom", url("boom/main.c")),
                    Submission::new("ok", url("ok/main.c")),
                ],
                |r| seen.push(r.id.clone()),
            )
            .await;

        seen.sort();
        assert_eq!(seen, ["boom", "ok"]);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].status, SubmissionStatus::LaunchFailed);
        assert!(reports[0].reason.as_deref().unwrap_or_default().contains("panic"), "{:?}", reports[0]);
        assert_eq!(reports[0].total, 2);
        assert!(reports[1].is_full_pass());

        let stored = store.get("boom").unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::LaunchFailed);
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_per_submission() {
        let host = Arc::new(
            MemoryHost::new()
                .commit("c1", 10, &[("ok/main.c", "#!/bin/sh\nread a b\necho $((a + b))\n")])
                .commit("c2", 20, &[("broken/main.c", "x")])
                .break_file("broken/main.c"),
        );
        let fx = fixture();
        let store = ReportStore::new(fx.dir.path().join("run"));
        let grader = Grader::new(host, &fx.cfg, sum_suite(), store).cutoff(Some(crate::memhost::at(100)));
        let grader = Arc::new(grader);
        let reports = grader
            .grade_all(
                &[
                    Submission::new("broken", url("broken/main.c")),
                    Submission::new("ok", url("ok/main.c")),
                    Submission::new("ghost", url("ghost/main.c")),
                ],
                |_| {},
            )
            .await;
        let statuses: Vec<_> = reports.iter().map(|r| (r.id.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            [
                ("broken", SubmissionStatus::FetchFailed),
                ("ghost", SubmissionStatus::Unresolved),
                ("ok", SubmissionStatus::Graded),
            ]
        );
        assert!(reports[2].is_full_pass());
    }
}
