//! Utility functions for directory management
//!
//! Paths follow the XDG Base Directory specification.
//!
//! # Directory Structure
//!
//! - Config: `~/.config/natfwd/` - `config.json`
//! - Data: `~/.local/share/natfwd/` - `rules.conf` and its checksum
//! - State: `~/.local/state/natfwd/` - `natfwd.log`, `audit.log`
//!
//! When running as root these resolve under `/root`, which is where the
//! rule file lives for the usual single-operator deployment.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "natfwd", "natfwd")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Default location of the rule file
pub fn default_rules_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("rules.conf"))
}

/// Creates a directory (and parents) readable only by the owner.
pub fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

pub fn ensure_dirs() -> std::io::Result<()> {
    for dir in [get_config_dir(), get_data_dir(), get_state_dir()]
        .into_iter()
        .flatten()
    {
        create_private_dir(&dir)?;
    }
    Ok(())
}
