use crate::core::validate::Finding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error types for hostwall
#[derive(Debug, Error)]
pub enum Error {
    /// The ruleset failed validation; nothing was touched
    #[error("Validation failed with {} error(s): {}", .findings.len(), summarize(.findings))]
    Validation { findings: Vec<Finding> },

    /// A backend cannot express a construct the ruleset requires
    #[error("Render error: {0}")]
    Render(String),

    /// Required native tool is missing or unreachable
    #[error("Backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// A native tool exited unsuccessfully
    #[error("{tool} failed: {message}")]
    Backend {
        tool: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// The live backend rejected or did not converge on the compiled artifact
    #[error("Apply failed: {0}")]
    ApplyFailure(String),

    /// Restoring the pre-apply snapshot failed; the host needs an operator
    #[error("Rollback failed, manual intervention required (last known-good snapshot: {snapshot_id}): {message}")]
    RollbackFailure {
        snapshot_id: String,
        message: String,
    },

    /// A step or tool exceeded its time budget
    #[error("Timed out during {0}")]
    Timeout(String),

    /// The caller cancelled the transaction
    #[error("Apply cancelled")]
    Cancelled,

    /// Another apply transaction holds the host lock
    #[error("Another apply is in progress: {0}")]
    Busy(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Configuration file is unreadable or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarize(findings: &[Finding]) -> String {
    findings
        .iter()
        .filter(|f| f.is_error())
        .map(|f| format!("{}: {}", f.subject, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot corrupted: {0}")]
    Corrupted(String),

    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Snapshot belongs to backend {found}, expected {expected}")]
    BackendMismatch { found: String, expected: String },

    #[error("Invalid snapshot id: {0}")]
    InvalidId(String),
}

/// Coarse error classification carried in apply reports
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Render,
    BackendUnavailable,
    Backend,
    ApplyFailure,
    RollbackFailure,
    Timeout,
    Cancelled,
    Busy,
    Io,
    Serialization,
    Snapshot,
    Elevation,
    Config,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Render(_) => ErrorKind::Render,
            Error::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Error::Backend { .. } => ErrorKind::Backend,
            Error::ApplyFailure(_) => ErrorKind::ApplyFailure,
            Error::RollbackFailure { .. } => ErrorKind::RollbackFailure,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Snapshot(_) => ErrorKind::Snapshot,
            Error::Elevation(_) => ErrorKind::Elevation,
            Error::Config(_) => ErrorKind::Config,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stderr captured from a failed native tool, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::Backend { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

impl From<crate::elevation::ElevationError> for Error {
    fn from(e: crate::elevation::ElevationError) -> Self {
        Error::Elevation(e.to_string())
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

/// Database of native firewall tool error patterns and their translations
pub struct BackendErrorPattern;

impl BackendErrorPattern {
    /// Matches a tool's stderr against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root or configure sudo/run0/pkexec for the firewall tools")
                .with_suggestion("Set HOSTWALL_ELEVATION_METHOD=sudo when using NOPASSWD sudoers rules")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("This usually means you need elevated privileges")
            .with_suggestion("Ensure sudo, run0 or pkexec is installed")
            .with_help("https://wiki.archlinux.org/title/Polkit");
        }

        if lower.contains("command not found") || lower.contains("not found in path") {
            return ErrorTranslation::new("Firewall tool is not installed or not found in PATH")
                .with_suggestion("Install the backend: nftables, iptables, firewalld or ufw")
                .with_suggestion("Or select another backend with --backend");
        }

        if lower.contains("firewalld is not running") || lower.contains("not running") {
            return ErrorTranslation::new("firewalld daemon is not running")
                .with_suggestion("Start it: sudo systemctl start firewalld")
                .with_suggestion("Or select another backend with --backend");
        }

        if lower.contains("firewall not enabled") || lower.contains("ufw is inactive") {
            return ErrorTranslation::new("ufw is not enabled")
                .with_suggestion("Enable it: sudo ufw enable")
                .with_suggestion("Rules written to /etc/ufw take effect once ufw is active");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Check your rule configuration for typos")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Ensure IP addresses and network masks are valid")
                .with_help(
                    "https://wiki.nftables.org/wiki-nftables/index.php/Simple_rule_management",
                );
        }

        if lower.contains("iptables-restore") && lower.contains("line") {
            return ErrorTranslation::new("iptables-restore rejected the rules file")
                .with_suggestion("The failing line number is reported in the message")
                .with_suggestion("Check that the comment and conntrack matches are available");
        }

        if lower.contains("invalid lhs of relational") {
            return ErrorTranslation::new("Protocol mismatch - trying to match incompatible field")
                .with_suggestion("Use TCP or UDP protocol when matching ports")
                .with_suggestion("For ICMP, remove port targets");
        }

        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("The table is created on the first successful apply")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Configuring_tables");
        }

        if lower.contains("chain")
            && (lower.contains("does not exist") || lower.contains("not found"))
        {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Ensure the chain exists before adding rules to it")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Configuring_chains");
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying the firewall")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The firewall operation took too long")
                .with_suggestion("Raise timeout_secs in the configuration");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
