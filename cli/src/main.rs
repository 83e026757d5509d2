use std::io::Write as _;

use cgrade_cli::cmd::{GlobalArgs, Unsuccessful};
use cgrade_core::style::ColorTheme as _;
use clap::Parser;
use colored::Colorize as _;

#[tokio::main]
async fn main() {
    let app = GlobalArgs::parse();
    init_logger(app.log_level);

    app.exec_subcmd().await.unwrap_or_else(|e| {
        if e.downcast_ref::<Unsuccessful>().is_none() {
            eprintln!("Error: {:?}", e);
        }
        std::process::exit(1);
    });
}

fn init_logger(level: Option<log::LevelFilter>) {
    let env = env_logger::Env::new().default_filter_or("warn");
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder
        .format(|buf, record| {
            let level = record.level();
            writeln!(
                buf,
                "{} {}",
                format!("[{}]", level).color(level.color()).bold(),
                record.args()
            )
        })
        .init();
}
