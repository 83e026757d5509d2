//! Per-submission reports, their keyed store, and the suite summary built
//! back from the store.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use cgrade_webclient::{Revision, UtcDateTime};
use serde::{Deserialize, Serialize};

use crate::stage::StageManifest;
use crate::submission::{is_safe_id, Submission};
use crate::testing::{TestSuite, TestVerdict};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SubmissionStatus {
    Graded,
    TooLate,
    Unresolved,
    UrlParseFailed,
    FetchFailed,
    CompileFailed,
    LaunchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileStatus {
    pub ok: bool,
    pub diagnostics: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub id: String,
    pub url: String,
    pub suite_name: String,
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileStatus>,
    /// In test case declaration order. Empty unless compilation succeeded.
    pub verdicts: Vec<TestVerdict>,
    pub passed: usize,
    pub failed: usize,
    /// Number of test cases in the suite, run or not.
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<StageManifest>,
    pub graded_at: UtcDateTime,
}

impl SubmissionReport {
    pub fn begin(submission: &Submission, suite: &TestSuite) -> Self {
        Self {
            id: submission.id.clone(),
            url: submission.url.clone(),
            suite_name: suite.name.clone(),
            status: SubmissionStatus::Graded,
            reason: None,
            revision: None,
            compile: None,
            verdicts: Vec::new(),
            passed: 0,
            failed: 0,
            total: suite.len(),
            manifest: None,
            graded_at: chrono::Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn with_manifest(mut self, manifest: StageManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// The pipeline stopped before any test ran.
    pub fn not_run(mut self, status: SubmissionStatus, reason: impl Display) -> Self {
        self.status = status;
        self.reason = Some(reason.to_string());
        self.set_verdicts(Vec::new());
        self
    }

    pub fn compile_failed(mut self, diagnostics: String, reason: impl Display) -> Self {
        self.compile = Some(CompileStatus {
            ok: false,
            diagnostics,
        });
        self.not_run(SubmissionStatus::CompileFailed, reason)
    }

    pub fn graded(mut self, compile_diagnostics: String, verdicts: Vec<TestVerdict>) -> Self {
        self.status = SubmissionStatus::Graded;
        self.reason = None;
        self.compile = Some(CompileStatus {
            ok: true,
            diagnostics: compile_diagnostics,
        });
        self.set_verdicts(verdicts);
        self
    }

    fn set_verdicts(&mut self, verdicts: Vec<TestVerdict>) {
        self.passed = verdicts.iter().filter(|v| v.passed).count();
        self.failed = verdicts.len() - self.passed;
        self.verdicts = verdicts;
    }

    pub fn not_run_count(&self) -> usize {
        self.total.saturating_sub(self.verdicts.len())
    }

    pub fn is_full_pass(&self) -> bool {
        self.status == SubmissionStatus::Graded && self.total > 0 && self.passed == self.total
    }
}

//---------------------------------------------------------
// store

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Refusing to store a report under unsafe id '{0}'")]
    UnsafeId(String),

    #[error("A report for '{0}' already exists in this run")]
    Duplicate(String),

    #[error(transparent)]
    Io(#[from] fsutil::Error),
}

/// One JSON file per submission under `<dir>/reports/`. Reports are written
/// once and never rewritten, so parallel graders never contend on a file.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    const REPORTS_SUBDIR: &'static str = "reports";
    const SUMMARY_FILENAME: &'static str = "summary.json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// A fresh run directory `<root>/<suite>-<timestamp>`.
    pub fn for_new_run(root: impl AsRef<Path>, suite_name: &str, now: UtcDateTime) -> Self {
        let stamp = now.format("%Y%m%d-%H%M%S");
        Self::new(root.as_ref().join(format!("{}-{}", suite_name, stamp)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(Self::REPORTS_SUBDIR)
            .join(format!("{}.json", id))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(Self::SUMMARY_FILENAME)
    }

    pub fn put(&self, report: &SubmissionReport) -> Result<PathBuf, StoreError> {
        if !is_safe_id(&report.id) {
            return Err(StoreError::UnsafeId(report.id.clone()));
        }
        let path = self.report_path(&report.id);
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| fsutil::Error::SerializeToJson(path.clone(), e))?;
        match fsutil::write_new_atomic(&path, json) {
            Ok(()) => Ok(path),
            Err(fsutil::Error::AlreadyExists(_)) => Err(StoreError::Duplicate(report.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// `Ok(None)` when no report was ever written for `id`.
    pub fn get(&self, id: &str) -> Result<Option<SubmissionReport>, StoreError> {
        if !is_safe_id(id) {
            return Err(StoreError::UnsafeId(id.to_owned()));
        }
        let path = self.report_path(id);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fsutil::read_json_with_deserialize(path)?))
    }

    /// Ids of every stored report, sorted.
    pub fn ids(&self) -> Result<Vec<String>, StoreError> {
        let reports_dir = self.dir.join(Self::REPORTS_SUBDIR);
        if !reports_dir.is_dir() {
            return Ok(Vec::new());
        }
        let opt = fsutil::WalkOpt {
            recursive: false,
            skip_hidden_dirs: true,
        };
        let mut ids: Vec<String> = fsutil::find_files_with_ext(&reports_dir, &["json"], opt)?
            .into_iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn put_summary(&self, summary: &SuiteSummary) -> Result<PathBuf, StoreError> {
        let path = self.summary_path();
        fsutil::write_json_with_mkdir(&path, summary)?;
        Ok(path)
    }
}

//---------------------------------------------------------
// summary

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RowOutcome {
    FullPass,
    Partial,
    NoPass,
    CompileFailed,
    NotRun { status: SubmissionStatus },
    Ungraded { reason: String },
}

impl RowOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::FullPass)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub id: String,
    pub passed: usize,
    pub failed: usize,
    pub not_run: usize,
    pub total: usize,
    pub outcome: RowOutcome,
}

impl SummaryRow {
    fn from_report(r: &SubmissionReport) -> Self {
        let outcome = match r.status {
            SubmissionStatus::Graded if r.is_full_pass() => RowOutcome::FullPass,
            SubmissionStatus::Graded if r.passed > 0 => RowOutcome::Partial,
            SubmissionStatus::Graded => RowOutcome::NoPass,
            SubmissionStatus::CompileFailed => RowOutcome::CompileFailed,
            status => RowOutcome::NotRun { status },
        };
        Self {
            id: r.id.clone(),
            passed: r.passed,
            failed: r.failed,
            not_run: r.not_run_count(),
            total: r.total,
            outcome,
        }
    }

    fn ungraded(id: &str, reason: impl Into<String>) -> Self {
        Self {
            id: id.to_owned(),
            passed: 0,
            failed: 0,
            not_run: 0,
            total: 0,
            outcome: RowOutcome::Ungraded {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTotals {
    pub submissions: usize,
    pub full_pass: usize,
    pub partial: usize,
    pub no_pass: usize,
    pub compile_failed: usize,
    pub not_run: usize,
    pub ungraded: usize,
    pub passed_tests: usize,
    pub total_tests: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSummary {
    /// Rows ordered by submission id.
    pub rows: Vec<SummaryRow>,
    pub totals: SummaryTotals,
}

impl SuiteSummary {
    /// Reads back every report of a run. With a roster, each listed id gets a
    /// row even if its report is missing or unreadable.
    pub fn from_store(store: &ReportStore, roster: Option<&[String]>) -> Result<Self, StoreError> {
        let ids: BTreeSet<String> = match roster {
            Some(ids) => ids.iter().cloned().collect(),
            None => store.ids()?.into_iter().collect(),
        };

        let rows = ids
            .iter()
            .map(|id| match store.get(id) {
                Ok(Some(report)) => SummaryRow::from_report(&report),
                Ok(None) => SummaryRow::ungraded(id, "no report"),
                Err(e) => {
                    log::warn!("[{}] Unreadable report: {:#}", id, e);
                    SummaryRow::ungraded(id, e.to_string())
                }
            })
            .collect();
        Ok(Self::from_rows(rows))
    }

    pub fn from_reports<'a>(reports: impl IntoIterator<Item = &'a SubmissionReport>) -> Self {
        let mut rows: Vec<_> = reports.into_iter().map(SummaryRow::from_report).collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Self::from_rows(rows)
    }

    fn from_rows(rows: Vec<SummaryRow>) -> Self {
        let mut totals = SummaryTotals {
            submissions: rows.len(),
            ..Default::default()
        };
        for row in &rows {
            totals.passed_tests += row.passed;
            totals.total_tests += row.total;
            match row.outcome {
                RowOutcome::FullPass => totals.full_pass += 1,
                RowOutcome::Partial => totals.partial += 1,
                RowOutcome::NoPass => totals.no_pass += 1,
                RowOutcome::CompileFailed => totals.compile_failed += 1,
                RowOutcome::NotRun { .. } => totals.not_run += 1,
                RowOutcome::Ungraded { .. } => totals.ungraded += 1,
            }
        }
        Self { rows, totals }
    }

    pub fn all_ok(&self) -> bool {
        self.rows.iter().all(|r| r.outcome.is_ok())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::testing::{judge, ExecutionOutcome, Expected, TestCase, Termination};

    fn suite() -> TestSuite {
        TestSuite::new(
            "sum",
            vec![
                TestCase::new("a", "1 2\n", Expected::One("3\n".into())),
                TestCase::new("b", "2 2\n", Expected::One("4\n".into())),
                TestCase::new("c", "5 5\n", Expected::One("10\n".into())),
            ],
        )
        .unwrap()
    }

    fn outcome(termination: Termination, stdout: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            termination,
            stdout: stdout.into(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration: Duration::from_millis(1),
        }
    }

    fn verdicts(suite: &TestSuite, time_out: Option<&str>) -> Vec<TestVerdict> {
        let answers = ["3\n", "4\n", "10\n"];
        suite
            .cases
            .iter()
            .zip(answers)
            .map(|(case, out)| {
                let t = if Some(case.name.as_str()) == time_out {
                    Termination::TimedOut
                } else {
                    Termination::Exited { code: 0 }
                };
                judge(case, outcome(t, out))
            })
            .collect()
    }

    fn sub(id: &str) -> Submission {
        Submission::new(id, format!("https://github.com/{}/hw", id))
    }

    #[test]
    fn compile_failure_has_no_verdicts() {
        let s = suite();
        let r = SubmissionReport::begin(&sub("x"), &s)
            .compile_failed("main.c:1: error: expected ';'".into(), "compilation failed");
        assert_eq!(r.status, SubmissionStatus::CompileFailed);
        assert!(r.verdicts.is_empty());
        assert_eq!(r.compile.as_ref().map(|c| c.ok), Some(false));
        assert!(!r.compile.unwrap().diagnostics.is_empty());
        assert_eq!((r.passed, r.failed, r.total), (0, 0, 3));
    }

    #[test]
    fn summary_of_three_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let s = suite();

        // inserted out of order on purpose
        let partial = SubmissionReport::begin(&sub("stu03"), &s).graded(String::new(), verdicts(&s, Some("b")));
        let broken = SubmissionReport::begin(&sub("stu01"), &s).compile_failed("error".into(), "compilation failed");
        let full = SubmissionReport::begin(&sub("stu02"), &s).graded(String::new(), verdicts(&s, None));
        for r in [&partial, &broken, &full] {
            store.put(r).unwrap();
        }

        let summary = SuiteSummary::from_store(&store, None).unwrap();
        let got: Vec<_> = summary
            .rows
            .iter()
            .map(|r| (r.id.as_str(), r.passed, r.total, r.outcome.clone()))
            .collect();
        assert_eq!(
            got,
            [
                ("stu01", 0, 3, RowOutcome::CompileFailed),
                ("stu02", 3, 3, RowOutcome::FullPass),
                ("stu03", 2, 3, RowOutcome::Partial),
            ]
        );
        assert_eq!(summary.rows[0].not_run, 3);
        assert_eq!(summary.totals.compile_failed, 1);
        assert_eq!(summary.totals.full_pass, 1);
        assert_eq!(summary.totals.partial, 1);
        assert_eq!(summary.totals.passed_tests, 5);
        assert!(!summary.all_ok());

        assert_eq!(SuiteSummary::from_reports([&full, &partial, &broken]), summary);
    }

    #[test]
    fn roster_surfaces_missing_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let s = suite();
        store
            .put(&SubmissionReport::begin(&sub("b"), &s).graded(String::new(), verdicts(&s, None)))
            .unwrap();
        fsutil::write_with_mkdir(store.report_path("c"), "{ not json").unwrap();

        let roster = vec!["c".to_owned(), "a".to_owned(), "b".to_owned()];
        let summary = SuiteSummary::from_store(&store, Some(&roster)).unwrap();
        let ids: Vec<_> = summary.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(matches!(summary.rows[0].outcome, RowOutcome::Ungraded { .. }));
        assert_eq!(summary.rows[1].outcome, RowOutcome::FullPass);
        assert!(matches!(summary.rows[2].outcome, RowOutcome::Ungraded { .. }));
        assert_eq!(summary.totals.ungraded, 2);
    }

    #[test]
    fn reports_are_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let s = suite();
        let r = SubmissionReport::begin(&sub("stu01"), &s).not_run(SubmissionStatus::TooLate, "late");
        let path = store.put(&r).unwrap();
        assert_eq!(path, dir.path().join("reports/stu01.json"));
        assert!(matches!(store.put(&r), Err(StoreError::Duplicate(_))));
        assert_eq!(store.get("stu01").unwrap(), Some(r));
        assert_eq!(store.get("nobody").unwrap(), None);
        assert_eq!(store.ids().unwrap(), ["stu01"]);
    }
}
