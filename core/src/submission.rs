use std::collections::HashSet;
use std::path::Path;

use cgrade_webclient::UtcDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Result<T> = std::result::Result<T, SubmissionListError>;

#[derive(Debug, thiserror::Error)]
pub enum SubmissionListError {
    #[error("Submission list must be a JSON array or an object with a 'students' array")]
    Shape,

    #[error("Invalid 'limit' timestamp '{0}' (expected RFC 3339)")]
    InvalidLimit(String),

    #[error("Student id '{0}' appears more than once")]
    DuplicateId(String),

    #[error("Unsafe student id '{0}'")]
    UnsafeId(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] fsutil::Error),
}

/// One student's entry: who, and where their code lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub url: String,
}

impl Submission {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmissionList {
    /// Deadline carried by the list itself; only applied on request.
    pub limit: Option<UtcDateTime>,
    pub students: Vec<Submission>,
}

impl SubmissionList {
    /// Accepts `[{"id","url"}, ...]` or `{"limit": "<RFC 3339>", "students": [...]}`.
    /// Entries lacking an id or url are skipped.
    pub fn from_json(s: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(s)?;
        let (limit, entries) = match root {
            Value::Array(entries) => (None, entries),
            Value::Object(mut obj) => {
                let limit = match obj.remove("limit") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) if s.trim().is_empty() => None,
                    Some(Value::String(s)) => Some(parse_limit(&s)?),
                    Some(other) => return Err(SubmissionListError::InvalidLimit(other.to_string())),
                };
                match obj.remove("students") {
                    Some(Value::Array(entries)) => (limit, entries),
                    _ => return Err(SubmissionListError::Shape),
                }
            }
            _ => return Err(SubmissionListError::Shape),
        };

        let mut seen = HashSet::new();
        let mut students = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let field = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            };
            let (Some(id), Some(url)) = (field("id"), field("url")) else {
                log::warn!("Skipping submission entry #{}: missing 'id' or 'url'", i + 1);
                continue;
            };
            if !is_safe_id(id) {
                return Err(SubmissionListError::UnsafeId(id.to_owned()));
            }
            if !seen.insert(id.to_owned()) {
                return Err(SubmissionListError::DuplicateId(id.to_owned()));
            }
            students.push(Submission::new(id, url));
        }

        Ok(Self { limit, students })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = fsutil::read_to_string(path)?;
        Self::from_json(&s)
    }

    pub fn ids(&self) -> Vec<String> {
        self.students.iter().map(|s| s.id.clone()).collect()
    }
}

fn parse_limit(s: &str) -> Result<UtcDateTime> {
    chrono::DateTime::parse_from_rfc3339(s.trim())
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|_| SubmissionListError::InvalidLimit(s.to_owned()))
}

/// Student ids become file names; keep them to a conservative alphabet.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}
