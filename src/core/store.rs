//! Durable, ordered rule storage
//!
//! The [`RuleStore`] owns the in-memory list of forwarding rules and the text
//! file it is persisted to. It is the single source of truth for intended
//! state; live nftables state is derived from it.
//!
//! Every mutation rewrites the whole file (temp file + rename) before
//! returning. If the write fails, the in-memory change is undone so memory
//! and disk never disagree.
//!
//! # File Format
//!
//! ```text
//! # comment lines start with '#', blank lines ignored
//! tcp 8080 10.0.0.5 80
//! ```
//!
//! The file is meant to be hand-editable. Malformed lines are dropped with a
//! warning on load instead of failing the whole load, and a SHA-256 sidecar
//! (`rules.conf.sha256`) only produces a warning when it does not match.

use crate::core::error::{Error, Result};
use crate::core::forward::{ForwardRule, MAX_RULES};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A data line that could not be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based line number in the file
    pub line: usize,
    pub reason: String,
}

/// Header written at the top of every saved rule file
const HEADER: [&str; 2] = [
    "# natfwd port forwarding rules",
    "# <protocol> <external-port> <destination-host> <destination-port>",
];

/// Outcome of parsing a rule file
#[derive(Debug, Default)]
pub struct ParsedRules {
    pub rules: Vec<ForwardRule>,
    pub skipped: Vec<SkippedLine>,
    /// Comment lines other than the generated header
    pub comments: usize,
}

impl ParsedRules {
    /// True when saving `rules` back would lose lines from the parsed text
    pub fn is_lossy(&self) -> bool {
        !self.skipped.is_empty() || self.comments > 0
    }
}

/// Parses rule-file text.
///
/// Blank lines and `#` comments are ignored. Lines that fail to parse, that
/// repeat an existing (protocol, external port) pair, or that exceed
/// [`MAX_RULES`] are reported in `skipped`.
pub fn parse_rules(text: &str) -> ParsedRules {
    let mut parsed = ParsedRules::default();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            if !HEADER.contains(&line) {
                parsed.comments += 1;
            }
            continue;
        }

        let reason = match line.parse::<ForwardRule>() {
            Ok(rule) => {
                if let Some(existing) = parsed.rules.iter().position(|r| r.conflicts_with(&rule)) {
                    format!("duplicates rule {existing} ({})", parsed.rules[existing])
                } else if parsed.rules.len() >= MAX_RULES {
                    format!("exceeds the {MAX_RULES} rule limit")
                } else {
                    parsed.rules.push(rule);
                    continue;
                }
            }
            Err(e) => e.to_string(),
        };

        parsed.skipped.push(SkippedLine {
            line: idx + 1,
            reason,
        });
    }

    parsed
}

/// Renders rules to rule-file text, one line per rule in store order.
pub fn render_rules(rules: &[ForwardRule]) -> String {
    let mut out = String::with_capacity(96 + rules.len() * 28);
    for line in HEADER {
        out.push_str(line);
        out.push('\n');
    }
    for rule in rules {
        out.push_str(&rule.to_string());
        out.push('\n');
    }
    out
}

fn checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".sha256");
    path.with_file_name(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Ordered, persisted collection of forwarding rules
#[derive(Debug)]
pub struct RuleStore {
    path: PathBuf,
    rules: Vec<ForwardRule>,
}

impl RuleStore {
    /// Opens the store at `path`, loading existing rules.
    ///
    /// A missing file yields an empty store; the file is created on the
    /// first mutation.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self {
            path: path.into(),
            rules: Vec::new(),
        };
        store.load().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rules(&self) -> &[ForwardRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Re-reads the file, replacing the in-memory rules.
    ///
    /// Returns the loaded rules. Only I/O failures other than "not found"
    /// are errors; bad lines are logged and skipped.
    pub async fn load(&mut self) -> Result<&[ForwardRule]> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No rule file at {:?}, starting empty", self.path);
                self.rules.clear();
                return Ok(&self.rules);
            }
            Err(e) => return Err(e.into()),
        };

        // Warn but don't fail: the file may have been edited by hand
        if let Ok(expected) = tokio::fs::read_to_string(sidecar_path(&self.path)).await {
            let actual = checksum(&text);
            if expected.trim() != actual {
                warn!(
                    "Rule file {:?} checksum mismatch (expected: {}, got: {})",
                    self.path,
                    expected.trim(),
                    actual
                );
            }
        }

        let parsed = parse_rules(&text);
        for skipped in &parsed.skipped {
            warn!(
                "{}:{}: dropping rule line: {}",
                self.path.display(),
                skipped.line,
                skipped.reason
            );
        }

        if parsed.is_lossy() {
            warn!(
                "{}: the next change rewrites this file from the {} loaded rule(s); \
                 {} dropped line(s) and {} comment line(s) will not be kept",
                self.path.display(),
                parsed.rules.len(),
                parsed.skipped.len(),
                parsed.comments
            );
        }

        info!("Loaded {} rule(s) from {:?}", parsed.rules.len(), self.path);
        self.rules = parsed.rules;
        Ok(&self.rules)
    }

    /// Snapshot of the rules with their current 0-based positions.
    ///
    /// Positions are renumbered after every removal; they are addresses for
    /// [`RuleStore::remove_at`], not stable identities.
    pub fn list(&self) -> Vec<(usize, ForwardRule)> {
        self.rules.iter().copied().enumerate().collect()
    }

    /// Appends a rule and persists. Returns its index.
    pub async fn add(&mut self, rule: ForwardRule) -> Result<usize> {
        if let Some(index) = self.rules.iter().position(|r| r.conflicts_with(&rule)) {
            return Err(Error::Duplicate {
                protocol: rule.protocol.to_string(),
                port: rule.external_port,
                index,
            });
        }
        if self.rules.len() >= MAX_RULES {
            return Err(Error::Capacity { max: MAX_RULES });
        }

        self.rules.push(rule);
        if let Err(e) = self.save().await {
            self.rules.pop();
            return Err(e);
        }

        Ok(self.rules.len() - 1)
    }

    /// Removes the rule at `index` and persists. Returns the removed rule.
    pub async fn remove_at(&mut self, index: usize) -> Result<ForwardRule> {
        if index >= self.rules.len() {
            return Err(Error::Index {
                index,
                len: self.rules.len(),
            });
        }

        let rule = self.rules.remove(index);
        if let Err(e) = self.save().await {
            self.rules.insert(index, rule);
            return Err(e);
        }

        Ok(rule)
    }

    /// Rewrites the whole file from memory.
    ///
    /// Uses a temporary file + rename so a crash or full disk never leaves a
    /// truncated rule file behind.
    pub async fn save(&self) -> Result<()> {
        let text = render_rules(&self.rules);
        self.write_atomic(&text).await.map_err(|source| Error::Persistence {
            path: self.path.clone(),
            source,
        })?;

        // The sidecar is advisory; a stale one only causes a warning on load
        if let Err(e) = tokio::fs::write(sidecar_path(&self.path), checksum(&text)).await {
            warn!("Failed to write rule checksum: {e}");
        }

        debug!("Persisted {} rule(s) to {:?}", self.rules.len(), self.path);
        Ok(())
    }

    async fn write_atomic(&self, text: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            crate::utils::create_private_dir(parent)?;
        }

        let tmp = temp_path(&self.path);

        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .await?;

            file.write_all(text.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            tokio::fs::write(&tmp, text).await?;
        }

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }
}
