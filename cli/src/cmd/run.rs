use std::path::PathBuf;

use anyhow::Context as _;
use cgrade_core::action;
use cgrade_core::testing::TestSuite;

use crate::util;

use super::{GlobalArgs, SubcmdResult, Unsuccessful};

/// Compile one local source tree (or file) and run the test suite against it
#[derive(Debug, clap::Args)]
pub struct Args {
    /// A C file, a source directory, or a staged submission directory
    #[arg(default_value = "./")]
    pub target: PathBuf,

    /// Test suite JSON
    #[arg(short, long)]
    pub tests: PathBuf,

    /// Override `[run].wall_time_secs`
    #[arg(long)]
    pub wall_time: Option<f64>,
}

pub async fn exec(args: &Args, _global_args: &GlobalArgs) -> SubcmdResult {
    let mut cfg = util::load_config()?;
    if let Some(secs) = args.wall_time {
        cfg.run.wall_time_secs = secs;
    }
    let suite = TestSuite::from_file(&args.tests)
        .with_context(|| format!("Failed to load test suite {:?}", args.tests))?;

    action::probe_toolchain(&cfg).await?;
    let verdicts = action::run_local(&cfg, &suite, &args.target).await?;

    let num_failed = verdicts.iter().filter(|v| !v.passed).count();
    if num_failed > 0 {
        return Err(Unsuccessful(format!("{} test(s) failed", num_failed)).into());
    }
    Ok(())
}
