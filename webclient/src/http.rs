use std::{sync::Arc, time::Duration};

use ::tokio::sync::Mutex;
use ::tokio::time::{Interval, MissedTickBehavior};
use rand::Rng as _;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER, USER_AGENT};

use crate::error::*;

pub use ::reqwest::{IntoUrl, Response, StatusCode, Url};
pub type UrlGlob = ::glob::Pattern;

const HEADER_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// How a rate-limited request (429, or 403 with an exhausted quota) or a
/// transient gateway failure (502, 503, 504) is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a wait announced by the server (`Retry-After`,
    /// `X-RateLimit-Reset`).
    pub max_announced_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_announced_wait: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone)]
pub struct Client {
    inner: ::reqwest::Client,
    req_intervals: Vec<(UrlGlob, Arc<Mutex<Interval>>)>,
    token: Option<String>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("authenticated", &self.token.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

enum Attempt {
    Done(Response),
    Wait { status: StatusCode, wait: Duration },
}

impl Client {
    pub fn new(
        url_wise_req_interval: impl IntoIterator<Item = (UrlGlob, Duration)>,
        token: Option<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let req_intervals = url_wise_req_interval
            .into_iter()
            .map(|(pat, dur)| {
                let mut interval = ::tokio::time::interval(dur);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                (pat, Arc::new(Mutex::new(interval)))
            })
            .collect();
        let inner = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            inner,
            req_intervals,
            token: token.filter(|t| !t.trim().is_empty()),
            retry,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    async fn throttle(&self, url: &Url) {
        let url_str = url.as_str();
        if let Some(interval) = self
            .req_intervals
            .iter()
            .find(|(pat, _)| pat.matches(url_str))
            .map(|(_, interval)| interval)
        {
            interval.lock().await.tick().await;
        }
    }

    /// GET with backoff on rate limiting and gateway errors. 404 maps to
    /// [`Error::NotFound`]; any other non-2xx status is returned as an error
    /// without retrying.
    pub async fn get(&self, url: Url, accept: &str) -> Result<Response> {
        let mut backoff = self.retry.initial_backoff;
        let mut last_status = StatusCode::TOO_MANY_REQUESTS;

        for attempt in 1..=self.retry.max_tries {
            match self.get_once(&url, accept, backoff).await? {
                Attempt::Done(resp) => return Ok(resp),
                Attempt::Wait { status, wait } => {
                    log::warn!(
                        "'{}' from {}. Sleeping {:.1}s (try {}/{})",
                        status,
                        url.host_str().unwrap_or("host"),
                        wait.as_secs_f64(),
                        attempt,
                        self.retry.max_tries
                    );
                    last_status = status;
                    if attempt < self.retry.max_tries {
                        ::tokio::time::sleep(wait).await;
                    }
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                }
            }
        }

        if last_status.is_server_error() {
            return Err(Error::UnexpectedResponseCode {
                got: last_status,
                requested_url: url.to_string(),
            });
        }
        Err(Error::RateLimited {
            requested_url: url.to_string(),
            attempts: self.retry.max_tries,
        })
    }

    async fn get_once(&self, url: &Url, accept: &str, backoff: Duration) -> Result<Attempt> {
        self.throttle(url).await;

        let mut req = self
            .inner
            .get(url.clone())
            .header(ACCEPT, accept)
            .header(USER_AGENT, concat!("cgrade/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(Attempt::Done(resp));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                requested_url: url.to_string(),
            });
        }
        if is_rate_limited(status, resp.headers()) {
            let wait = announced_wait(resp.headers())
                .map(|d| d.min(self.retry.max_announced_wait))
                .unwrap_or_else(|| with_jitter(backoff));
            return Ok(Attempt::Wait { status, wait });
        }
        if is_transient(status) {
            return Ok(Attempt::Wait {
                status,
                wait: with_jitter(backoff),
            });
        }
        Err(Error::UnexpectedResponseCode {
            got: status,
            requested_url: url.to_string(),
        })
    }
}

fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    match status {
        StatusCode::TOO_MANY_REQUESTS => true,
        StatusCode::FORBIDDEN => {
            headers.contains_key(RETRY_AFTER)
                || header_u64(headers, HEADER_RATELIMIT_REMAINING) == Some(0)
        }
        _ => false,
    }
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn announced_wait(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = header_u64(headers, RETRY_AFTER.as_str()) {
        return Some(Duration::from_secs(secs));
    }
    let reset = header_u64(headers, HEADER_RATELIMIT_RESET)?;
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    Some(Duration::from_secs(reset.saturating_sub(now) + 1))
}

fn with_jitter(base: Duration) -> Duration {
    let quarter = (base.as_millis() / 4) as u64;
    if quarter == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
}
