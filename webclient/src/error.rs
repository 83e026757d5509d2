use reqwest::StatusCode;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not found: {requested_url}")]
    NotFound { requested_url: String },

    #[error("Unexpected response code '{got}' while requesting to {requested_url}")]
    UnexpectedResponseCode {
        got: StatusCode,
        requested_url: String,
    },

    #[error("Still rate limited after {attempts} attempts while requesting to {requested_url}")]
    RateLimited { requested_url: String, attempts: u32 },

    #[error("Content too large ({size} bytes, limit {limit}) at {requested_url}")]
    TooLarge {
        requested_url: String,
        size: u64,
        limit: u64,
    },

    #[error("Failed to parse as URL '{url}'")]
    InvalidSyntaxUrl {
        url: String,

        #[source]
        source: url::ParseError,
    },

    #[error("Cannot build request URL from base '{0}'")]
    CannotBeABase(String),

    #[error("Malformed response from {requested_url}: {reason}")]
    MalformedResponse {
        requested_url: String,
        reason: String,
    },

    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Network-level trouble (host unreachable, connection reset, ...).
    pub fn is_unreachable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::RateLimited { .. } => true,
            _ => false,
        }
    }
}
