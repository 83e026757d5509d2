use std::path::PathBuf;

use anyhow::Context as _;
use cgrade_core::submission::SubmissionList;
use cgrade_core::{action, style};

use super::{GlobalArgs, SubcmdResult, Unsuccessful};

/// Print the summary table of a finished grading run
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Run directory written by `cgrade grade`
    pub report_dir: PathBuf,

    /// Submission list; listed students without a report show up as ungraded
    #[arg(short, long)]
    pub list: Option<PathBuf>,
}

pub fn exec(args: &Args, _global_args: &GlobalArgs) -> SubcmdResult {
    let roster = args
        .list
        .as_ref()
        .map(|path| {
            SubmissionList::from_file(path)
                .with_context(|| format!("Failed to load submission list {:?}", path))
        })
        .transpose()?;

    let summary = action::summarize(&args.report_dir, roster.as_ref())?;
    style::print_summary_table(&summary);

    if !summary.all_ok() {
        return Err(Unsuccessful("Some submissions did not pass".into()).into());
    }
    Ok(())
}
