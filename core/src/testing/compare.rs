//! Deciding whether one execution satisfies one test case.
//!
//! Judging is a pure function of the outcome and the case: the same inputs
//! always give the same verdict.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use super::runner::{ExecutionOutcome, ResourceKind, Termination};
use super::testcase::{StripMode, TestCase};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailureReason {
    TimedOut,
    ResourceExceeded,
    ExitCode,
    Stdout,
    ExitCodeAndStdout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explanation {
    pub reason: FailureReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Result of running one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVerdict {
    pub name: String,
    pub passed: bool,
    pub outcome: ExecutionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<Explanation>,
}

/// CRLF and lone CR become LF.
pub fn normalize_line_endings(s: &str) -> Cow<'_, str> {
    if !s.contains('\r') {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.replace("\r\n", "\n").replace('\r', "\n"))
}

fn canonical(s: &str, strip: StripMode) -> String {
    let normalized = normalize_line_endings(s);
    strip.apply(&normalized).to_owned()
}

fn equivalent(actual: &str, accepted: &str, ignore_case: bool) -> bool {
    if ignore_case {
        actual.to_lowercase() == accepted.to_lowercase()
    } else {
        actual == accepted
    }
}

/// Renders expected against actual output with newlines made visible in the
/// expected half.
pub fn diff_block(expected: &str, actual: &str) -> String {
    let block = format!(
        "--- expected ---\n{}\n---   got    ---\n{}",
        expected.replace('\n', "\\n\n"),
        actual
    );
    block.trim_end().to_owned()
}

pub fn judge(case: &TestCase, outcome: ExecutionOutcome) -> TestVerdict {
    let explanation = explain_failure(case, &outcome);
    TestVerdict {
        name: case.name.clone(),
        passed: explanation.is_none(),
        outcome,
        explanation,
    }
}

fn explain_failure(case: &TestCase, outcome: &ExecutionOutcome) -> Option<Explanation> {
    match outcome.termination {
        Termination::TimedOut => {
            return Some(Explanation {
                reason: FailureReason::TimedOut,
                resource: None,
                expected_exit_code: case.exit_code,
                diff: None,
            })
        }
        Termination::ResourceExceeded { resource } => {
            return Some(Explanation {
                reason: FailureReason::ResourceExceeded,
                resource: Some(resource),
                expected_exit_code: case.exit_code,
                diff: None,
            })
        }
        Termination::Exited { .. } | Termination::Crashed { .. } => {}
    }

    let exit_ok = match case.exit_code {
        Some(want) => outcome.exit_code() == Some(want),
        None => true,
    };

    let actual = canonical(&outcome.stdout, case.strip);
    let accepted: Vec<String> = case
        .expected
        .values()
        .iter()
        .map(|v| canonical(v, case.strip))
        .collect();
    let stdout_ok = accepted
        .iter()
        .any(|want| equivalent(&actual, want, case.ignore_case));

    let reason = match (exit_ok, stdout_ok) {
        (true, true) => return None,
        (false, true) => FailureReason::ExitCode,
        (true, false) => FailureReason::Stdout,
        (false, false) => FailureReason::ExitCodeAndStdout,
    };
    let diff = (!stdout_ok).then(|| {
        let expected = accepted.first().map(String::as_str).unwrap_or_default();
        diff_block(expected, &actual)
    });
    Some(Explanation {
        reason,
        resource: None,
        expected_exit_code: case.exit_code,
        diff,
    })
}
