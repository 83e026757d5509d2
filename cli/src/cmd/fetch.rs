use std::path::PathBuf;

use anyhow::Context as _;
use cgrade_core::config::HostEnv;
use cgrade_core::submission::{Submission, SubmissionList};
use cgrade_core::{action, print_success};
use colored::Colorize as _;

use crate::util;

use super::{CutoffArgs, GlobalArgs, SubcmdResult, Unsuccessful};

/// Resolve and stage submissions without building them
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Submission URL
    #[arg(required_unless_present = "list", conflicts_with = "list")]
    pub url: Option<String>,

    /// Id (and staging directory name) for a single URL
    #[arg(long, default_value = "manual")]
    pub id: String,

    /// Submission list JSON
    #[arg(short, long)]
    pub list: Option<PathBuf>,

    /// Override `[fetch].data_root`
    #[arg(long)]
    pub data_root: Option<PathBuf>,

    #[command(flatten)]
    pub cutoff: CutoffArgs,
}

pub async fn exec(args: &Args, _global_args: &GlobalArgs) -> SubcmdResult {
    let mut cfg = util::load_config()?;
    if let Some(dir) = &args.data_root {
        cfg.fetch.data_root = dir.clone();
    }
    let host = action::github_client(&cfg, &HostEnv::from_env()?)?;

    let list = match (&args.url, &args.list) {
        (Some(url), _) => SubmissionList {
            limit: None,
            students: vec![Submission::new(&args.id, url)],
        },
        (None, Some(path)) => SubmissionList::from_file(path)
            .with_context(|| format!("Failed to load submission list {:?}", path))?,
        (None, None) => anyhow::bail!("Give a submission URL or --list"),
    };
    let cutoff = args.cutoff.effective(list.limit);

    let mut num_failed = 0;
    for (id, res) in action::fetch_list(host, &cfg, &list, cutoff).await {
        match res {
            Ok(staged) => {
                print_success!(
                    "[{}] Staged {} @ {} -> {}",
                    id,
                    staged.manifest.repo,
                    staged.manifest.revision,
                    util::replace_homedir_to_tilde(staged.main_path()).to_string_lossy()
                );
            }
            Err(e) => {
                num_failed += 1;
                eprintln!("{} {:#}", "Failed:".bright_red().bold(), e);
            }
        }
    }

    if num_failed > 0 {
        return Err(Unsuccessful(format!("{} submission(s) could not be staged", num_failed)).into());
    }
    Ok(())
}
