use std::path::PathBuf;
use thiserror::Error;

/// One of the two packet-filter directives a forwarding rule installs
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Directive {
    /// Destination rewrite on the ingress (prerouting) path
    #[strum(serialize = "dnat")]
    Dnat,
    /// Source rewrite on the egress (postrouting) path
    #[strum(serialize = "masquerade")]
    Masquerade,
}

/// Core error types for natfwd
#[derive(Debug, Error)]
pub enum Error {
    /// A rule field failed validation; nothing was mutated
    #[error("Invalid {field}: {message}")]
    Format { field: &'static str, message: String },

    /// A position outside the current store bounds was addressed
    #[error("No rule at index {index} (store has {len} rules)")]
    Index { index: usize, len: usize },

    /// A rule with the same protocol and external port already exists
    #[error("A {protocol} rule for external port {port} already exists (index {index})")]
    Duplicate {
        protocol: String,
        port: u16,
        index: usize,
    },

    /// The store is full
    #[error("Rule store is full (max {max} rules)")]
    Capacity { max: usize },

    /// Writing the rule file failed; the in-memory change was rolled back
    #[error("Failed to persist rules to {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One directive of a rule was installed and the other was not
    #[error("Partially applied: {applied} installed, {failed} failed: {message}")]
    PartialApply {
        applied: Directive,
        failed: Directive,
        message: String,
    },

    /// Applying a new rule failed and every trace of it was removed again
    #[error("{cause} (rolled back, nothing was added)")]
    RolledBack { cause: Box<Error> },

    /// Applying a new rule failed and undoing it failed too
    #[error("{apply}; rollback also failed: {rollback}")]
    RollbackFailed {
        apply: Box<Error>,
        rollback: Box<Error>,
    },

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// An nft invocation did not finish in time and was killed
    #[error("nft did not complete within {0} seconds")]
    Timeout(u64),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn format(field: &'static str, message: impl Into<String>) -> Self {
        Self::Format {
            field,
            message: message.into(),
        }
    }

    /// Raw nft stderr, if this error came from an nft invocation
    pub fn nft_stderr(&self) -> Option<&str> {
        match self {
            Self::Nftables { stderr, .. } => stderr.as_deref(),
            Self::PartialApply { message, .. } => Some(message),
            Self::RolledBack { cause } => cause.nft_stderr(),
            Self::RollbackFailed { apply, rollback } => {
                apply.nft_stderr().or_else(|| rollback.nft_stderr())
            }
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of nftables error patterns and their translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify NAT rules")
                .with_suggestion("Run natfwd as root, or make sure sudo/run0/pkexec is available")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Quick_reference-nftables_in_10_minutes");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("This usually means you need elevated privileges")
            .with_suggestion("Set NATFWD_ELEVATION_METHOD=sudo to force sudo");
        }

        if lower.contains("command not found")
            || (lower.contains("no such file") && !lower.contains("table"))
        {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S nftables  (Arch)")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Main_Page");
        }

        // nat chains need nft_chain_nat / nf_nat loaded
        if lower.contains("could not process rule") && lower.contains("not supported") {
            return ErrorTranslation::new("Kernel NAT support is missing")
                .with_suggestion("Load the NAT modules: sudo modprobe nft_chain_nat nf_nat")
                .with_suggestion("Check kernel modules: lsmod | grep nf_")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Performing_Network_Address_Translation_(NAT)");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("nftables rejected the forwarding rule")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Ensure the destination is a plain IPv4 address")
                .with_help(
                    "https://wiki.nftables.org/wiki-nftables/index.php/Simple_rule_management",
                );
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Packet filter resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("within") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The nft command took too long")
                .with_suggestion("Raise nft_timeout_secs in config.json if the host is slow");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        ErrorTranslation::new(format!("Packet filter error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify nftables is working: sudo nft list ruleset")
            .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
