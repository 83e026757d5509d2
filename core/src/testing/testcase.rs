use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("Test suite must be a JSON array of test cases: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Test suite is empty")]
    Empty,

    #[error("Duplicate test name '{0}'")]
    DuplicateName(String),

    #[error("Test '{0}' has no accepted output")]
    NoAcceptedOutput(String),

    #[error(transparent)]
    Io(#[from] fsutil::Error),
}

/// One accepted stdout, or a set of them where any match passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expected {
    One(String),
    Any(Vec<String>),
}

impl Expected {
    pub fn values(&self) -> &[String] {
        match self {
            Expected::One(s) => std::slice::from_ref(s),
            Expected::Any(v) => v,
        }
    }
}

/// Whitespace trimming applied after line-ending normalization.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StripMode {
    #[default]
    None,
    Left,
    Right,
    Both,
}

impl StripMode {
    pub fn apply<'a>(&self, s: &'a str) -> &'a str {
        match self {
            StripMode::None => s,
            StripMode::Left => s.trim_start(),
            StripMode::Right => s.trim_end(),
            StripMode::Both => s.trim(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub stdin: String,
    pub expected: Expected,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub strip: StripMode,
    #[serde(default)]
    pub ignore_case: bool,
}

impl TestCase {
    pub fn new(name: impl Into<String>, stdin: impl Into<String>, expected: Expected) -> Self {
        Self {
            name: name.into(),
            stdin: stdin.into(),
            expected,
            exit_code: None,
            strip: StripMode::None,
            ignore_case: false,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

#[derive(Debug, Deserialize)]
struct RawTestCase {
    name: Option<String>,
    stdin: String,
    expected: Expected,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    strip: StripMode,
    #[serde(default)]
    ignore_case: bool,
}

/// Ordered, read-only set of test cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSuite {
    pub name: String,
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(name: impl Into<String>, cases: Vec<TestCase>) -> Result<Self, SuiteError> {
        if cases.is_empty() {
            return Err(SuiteError::Empty);
        }
        let mut names = HashSet::new();
        for case in &cases {
            if !names.insert(case.name.as_str()) {
                return Err(SuiteError::DuplicateName(case.name.clone()));
            }
            if case.expected.values().is_empty() {
                return Err(SuiteError::NoAcceptedOutput(case.name.clone()));
            }
        }
        Ok(Self {
            name: name.into(),
            cases,
        })
    }

    /// Unnamed cases become `case-<n>` (1-based position).
    pub fn from_json(name: impl Into<String>, s: &str) -> Result<Self, SuiteError> {
        let raw: Vec<RawTestCase> = serde_json::from_str(s)?;
        let cases = raw
            .into_iter()
            .enumerate()
            .map(|(i, t)| TestCase {
                name: t
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("case-{}", i + 1)),
                stdin: t.stdin,
                expected: t.expected,
                exit_code: t.exit_code,
                strip: t.strip,
                ignore_case: t.ignore_case,
            })
            .collect();
        Self::new(name, cases)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SuiteError> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tests".into());
        let json = fsutil::read_to_string(path)?;
        Self::from_json(name, &json)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
