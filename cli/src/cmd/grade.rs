use std::path::PathBuf;

use anyhow::Context as _;
use cgrade_core::config::HostEnv;
use cgrade_core::submission::SubmissionList;
use cgrade_core::testing::TestSuite;
use cgrade_core::{action, print_success, style};

use crate::util;

use super::{CutoffArgs, GlobalArgs, SubcmdResult, Unsuccessful};

/// Grade every submission of a list and write a report directory
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Submission list JSON
    pub list: PathBuf,

    /// Test suite JSON
    #[arg(short, long)]
    pub tests: PathBuf,

    /// Override `[report].dir`
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// Override `[fetch].data_root`
    #[arg(long)]
    pub data_root: Option<PathBuf>,

    /// Override `[run].parallelism`
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,

    #[command(flatten)]
    pub cutoff: CutoffArgs,
}

pub async fn exec(args: &Args, _global_args: &GlobalArgs) -> SubcmdResult {
    let mut cfg = util::load_config()?;
    if let Some(dir) = &args.report_dir {
        cfg.report.dir = dir.clone();
    }
    if let Some(dir) = &args.data_root {
        cfg.fetch.data_root = dir.clone();
    }
    if let Some(n) = args.parallelism {
        cfg.run.parallelism = n;
    }

    let list = SubmissionList::from_file(&args.list)
        .with_context(|| format!("Failed to load submission list {:?}", args.list))?;
    let suite = TestSuite::from_file(&args.tests)
        .with_context(|| format!("Failed to load test suite {:?}", args.tests))?;
    let cutoff = args.cutoff.effective(list.limit);
    if let Some(t) = cutoff {
        log::info!("Grading the last commit at or before {}", t);
    }

    let host = action::github_client(&cfg, &HostEnv::from_env()?)?;
    let (store, summary) = action::grade_submissions(host, &cfg, suite, &list, cutoff).await?;

    style::print_summary_table(&summary);
    print_success!(
        "Reports written to {}",
        util::replace_homedir_to_tilde(store.dir()).to_string_lossy()
    );

    if !summary.all_ok() {
        return Err(Unsuccessful("Some submissions did not pass".into()).into());
    }
    Ok(())
}
