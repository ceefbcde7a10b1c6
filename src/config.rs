use crate::utils::{default_rules_path, get_config_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Table used when the config does not name one. Packagers can override it at
/// build time with `NATFWD_DEFAULT_TABLE`.
pub const DEFAULT_TABLE: &str = match option_env!("NATFWD_DEFAULT_TABLE") {
    Some(table) => table,
    None => "natfwd",
};

pub const DEFAULT_NFT_TIMEOUT_SECS: u64 = 10;
pub const MAX_NFT_TIMEOUT_SECS: u64 = 300;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Rule file location; `None` means `<data dir>/rules.conf`
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
    /// nftables table owned by natfwd
    #[serde(default = "default_table")]
    pub table: String,
    /// Per-invocation limit for `nft`, clamped to 1..=300 seconds
    #[serde(default = "default_nft_timeout")]
    pub nft_timeout_secs: u64,
    /// Append mutations to the audit log in the state directory
    #[serde(default = "default_true")]
    pub audit: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rules_file: None,
            table: default_table(),
            nft_timeout_secs: DEFAULT_NFT_TIMEOUT_SECS,
            audit: true,
        }
    }
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_nft_timeout() -> u64 {
    DEFAULT_NFT_TIMEOUT_SECS
}

impl AppConfig {
    /// Resolved rule file path
    pub fn rules_path(&self) -> Option<PathBuf> {
        self.rules_file.clone().or_else(default_rules_path)
    }

    pub fn nft_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.nft_timeout_secs)
    }

    /// Replaces out-of-range values with usable ones, warning about each.
    fn sanitize(mut self) -> Self {
        if let Err(e) = crate::validators::validate_table_name(&self.table) {
            warn!("Ignoring configured table {:?}: {}", self.table, e);
            self.table = default_table();
        }
        let clamped = self.nft_timeout_secs.clamp(1, MAX_NFT_TIMEOUT_SECS);
        if clamped != self.nft_timeout_secs {
            warn!(
                "nft_timeout_secs {} out of range, using {}",
                self.nft_timeout_secs, clamped
            );
            self.nft_timeout_secs = clamped;
        }
        self
    }
}

/// Default config file: `<config dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config using an atomic write: temp file created with mode 0o600,
/// synced, then renamed over `path`.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        crate::utils::create_private_dir(parent)?;
    }

    if let Err(e) = write_and_rename(&json, &temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        });
    }
    Ok(())
}

async fn write_and_rename(json: &str, temp_path: &Path, path: &Path) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    // Create file with restrictive permissions from the start
    #[cfg(unix)]
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(temp_path)
        .await?;

    #[cfg(not(unix))]
    let mut file = tokio::fs::File::create(temp_path).await?;

    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(temp_path, path).await
}

/// Loads the config from `path` (or the default location), falling back to
/// defaults when the file is missing or unreadable.
pub async fn load_config(path: Option<&Path>) -> AppConfig {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return AppConfig::default();
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => config.sanitize(),
            Err(e) => {
                warn!("Invalid config {}: {}, using defaults", path.display(), e);
                AppConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            warn!("Cannot read config {}: {}, using defaults", path.display(), e);
            AppConfig::default()
        }
    }
}
