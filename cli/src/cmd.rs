pub mod fetch;
pub mod grade;
pub mod init;
pub mod run;
pub mod summary;

use cgrade_webclient::UtcDateTime;

#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct GlobalArgs {
    #[command(subcommand)]
    pub subcmd: Subcommand,

    /// Log filter level (overrides RUST_LOG): off, error, warn, info, debug, trace
    #[arg(long, global = true, value_parser = parse_level)]
    pub log_level: Option<log::LevelFilter>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Init(init::Args),
    Fetch(fetch::Args),

    #[command(alias("r"))]
    Run(run::Args),

    #[command(alias("g"))]
    Grade(grade::Args),

    Summary(summary::Args),
}

pub type SubcmdResult = anyhow::Result<()>;

/// The command ran, but its results were not all OK. Already reported to the user.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Unsuccessful(pub String);

impl GlobalArgs {
    pub async fn exec_subcmd(&self) -> SubcmdResult {
        use Subcommand::*;
        match &self.subcmd {
            Init(args) => init::exec(args, self),
            Fetch(args) => fetch::exec(args, self).await,
            Run(args) => run::exec(args, self).await,
            Grade(args) => grade::exec(args, self).await,
            Summary(args) => summary::exec(args, self),
        }
    }
}

/// Cutoff options shared by `fetch` and `grade`.
#[derive(Debug, Clone, clap::Args)]
pub struct CutoffArgs {
    /// Grade the last commit at or before the submission list's `limit`
    #[arg(long)]
    pub respect_limit: bool,

    /// Explicit cutoff (RFC 3339), takes precedence over --respect-limit
    #[arg(long, value_parser = parse_rfc3339)]
    pub cutoff: Option<UtcDateTime>,
}

impl CutoffArgs {
    pub fn effective(&self, list_limit: Option<UtcDateTime>) -> Option<UtcDateTime> {
        if self.cutoff.is_some() {
            return self.cutoff;
        }
        if self.respect_limit {
            if list_limit.is_none() {
                log::warn!("--respect-limit given, but the submission list has no limit");
            }
            return list_limit;
        }
        None
    }
}

fn parse_level(s: &str) -> Result<log::LevelFilter, String> {
    s.parse()
        .map_err(|_| format!("unknown log level '{}'", s))
}

fn parse_rfc3339(s: &str) -> Result<UtcDateTime, String> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| format!("invalid RFC 3339 time '{}': {}", s, e))
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn explicit_cutoff_wins() {
        let limit = chrono::Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let explicit = parse_rfc3339("2023-04-30T12:00:00+09:00").unwrap();
        assert_eq!(explicit, chrono::Utc.with_ymd_and_hms(2023, 4, 30, 3, 0, 0).unwrap());

        let args = CutoffArgs {
            respect_limit: true,
            cutoff: Some(explicit),
        };
        assert_eq!(args.effective(Some(limit)), Some(explicit));

        let args = CutoffArgs {
            respect_limit: true,
            cutoff: None,
        };
        assert_eq!(args.effective(Some(limit)), Some(limit));

        let args = CutoffArgs {
            respect_limit: false,
            cutoff: None,
        };
        assert_eq!(args.effective(Some(limit)), None);
    }

    #[test]
    fn rejects_malformed_cutoff() {
        assert!(parse_rfc3339("yesterday").is_err());
    }
}
