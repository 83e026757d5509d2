use std::{
    path::{Path, PathBuf},
    process::exit,
};

use cgrade_core::Config;

pub fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|e| {
        eprintln!("Failed to get current dir: {}", e);
        exit(1);
    })
}

pub fn replace_homedir_to_tilde(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    let Some(home_dir) = ::dirs::home_dir() else {
        return path
    };
    path.strip_prefix(home_dir)
        .map(|path| Path::new("~").join(path))
        .unwrap_or(path)
}

pub fn load_config() -> anyhow::Result<Config> {
    let cfg = Config::load_or_default(self::current_dir())?;
    if let Some(path) = &cfg.source_config_file {
        log::info!(
            "Using config {}",
            self::replace_homedir_to_tilde(path).to_string_lossy()
        );
    }
    Ok(cfg)
}
