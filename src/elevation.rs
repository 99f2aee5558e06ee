//! Privilege elevation for system operations
//!
//! hostwall may run as an unprivileged user and only elevates the native
//! firewall tools it drives. The set of binaries that can ever be elevated is
//! closed: callers name a [`Tool`], never a free-form program path.
//!
//! # Elevation Strategy
//!
//! - **Root**: commands run directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `HOSTWALL_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for automation with sudoers NOPASSWD rules.
//!   Example: `HOSTWALL_ELEVATION_METHOD=sudo hostwall apply rules.json`
//!
//! - `HOSTWALL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only the tools in [`Tool`] can be elevated
//! - Commands are constructed without shell interpolation
//! - Audit logging tracks all privileged operations (via caller)
//!
//! # Example
//!
//! ```no_run
//! use hostwall::elevation::{Tool, create_elevated_command};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_command(Tool::Nft, &["-j", "list", "ruleset"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::path::PathBuf;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `HOSTWALL_ELEVATION_METHOD`
    #[error("Invalid HOSTWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// A command named a program outside the approved tool set
    #[error("'{0}' is not an approved firewall tool")]
    UnknownTool(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Native tools hostwall is allowed to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum Tool {
    Nft,
    Iptables,
    Ip6tables,
    IptablesSave,
    Ip6tablesSave,
    IptablesRestore,
    Ip6tablesRestore,
    FirewallCmd,
    Ufw,
    /// Writes root-owned configuration files
    Install,
    /// Reads root-only configuration files
    Cat,
}

impl Tool {
    pub const fn program(self) -> &'static str {
        match self {
            Tool::Nft => "nft",
            Tool::Iptables => "iptables",
            Tool::Ip6tables => "ip6tables",
            Tool::IptablesSave => "iptables-save",
            Tool::Ip6tablesSave => "ip6tables-save",
            Tool::IptablesRestore => "iptables-restore",
            Tool::Ip6tablesRestore => "ip6tables-restore",
            Tool::FirewallCmd => "firewall-cmd",
            Tool::Ufw => "ufw",
            Tool::Install => "install",
            Tool::Cat => "cat",
        }
    }

    /// Looks up an approved tool by program name.
    pub fn from_program(name: &str) -> Result<Self, ElevationError> {
        use strum::IntoEnumIterator;
        Tool::iter()
            .find(|t| t.program() == name)
            .ok_or_else(|| ElevationError::UnknownTool(name.to_string()))
    }

    /// Returns `true` if the tool's binary can be found.
    pub fn is_available(self) -> bool {
        binary_exists(self.program())
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// Firewall tools usually live in sbin directories that unprivileged PATHs omit
const SBIN_DIRS: [&str; 2] = ["/usr/sbin", "/sbin"];

/// Checks if a binary exists in PATH or a system sbin directory
///
/// # Arguments
///
/// * `name` - Binary name to search for (e.g., "pkexec", "nft")
fn binary_exists(name: &str) -> bool {
    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();
    dirs.extend(SBIN_DIRS.iter().map(PathBuf::from));

    dirs.iter().any(|dir| dir.join(name).is_file())
}

fn wrapped(wrapper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

/// Builds a command running `tool` with root privileges.
///
/// Arguments are passed directly to the tool without shell interpretation.
/// Callers must validate anything user-supplied before it gets here.
///
/// # Testing
///
/// Set `HOSTWALL_TEST_NO_ELEVATION=1` to run the tool directly.
pub fn create_elevated_command(tool: Tool, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    let program = tool.program();

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("HOSTWALL_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override (for sudoers NOPASSWD setups)
    if let Ok(method) = std::env::var("HOSTWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (no SUID), fall back to sudo/pkexec
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        assert!(!binary_exists("hostwall_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_tool_lookup_is_closed() {
        assert_eq!(Tool::from_program("nft").unwrap(), Tool::Nft);
        assert_eq!(Tool::from_program("ip6tables-restore").unwrap(), Tool::Ip6tablesRestore);
        assert!(matches!(
            Tool::from_program("rm"),
            Err(ElevationError::UnknownTool(_))
        ));
        assert!(matches!(
            Tool::from_program("/usr/sbin/nft"),
            Err(ElevationError::UnknownTool(_))
        ));
    }

    #[tokio::test]
    async fn test_create_command_test_mode() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var("HOSTWALL_TEST_NO_ELEVATION", "1");
        }

        let cmd = create_elevated_command(Tool::Nft, &["list", "ruleset"]).unwrap();
        assert_eq!(cmd.as_std().get_program(), "nft");

        let cmd = create_elevated_command(Tool::Install, &["-m", "600", "/tmp/a", "/tmp/b"]);
        assert!(cmd.is_ok());
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::remove_var("HOSTWALL_TEST_NO_ELEVATION");
            std::env::set_var("HOSTWALL_ELEVATION_METHOD", "invalid_method");
        }

        let result = create_elevated_command(Tool::Nft, &["list", "ruleset"]);

        unsafe {
            std::env::set_var("HOSTWALL_TEST_NO_ELEVATION", "1");
            std::env::remove_var("HOSTWALL_ELEVATION_METHOD");
        }

        // Running the suite as root short-circuits before the method check
        if !nix::unistd::getuid().is_root() {
            assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
        }
    }

    #[test]
    fn test_elevation_method_case_insensitive() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::remove_var("HOSTWALL_TEST_NO_ELEVATION");
            std::env::set_var("HOSTWALL_ELEVATION_METHOD", "SUDO");
        }

        let result = create_elevated_command(Tool::Nft, &["list", "ruleset"]);

        unsafe {
            std::env::set_var("HOSTWALL_TEST_NO_ELEVATION", "1");
            std::env::remove_var("HOSTWALL_ELEVATION_METHOD");
        }

        // Succeeds (sudo exists) or fails with MethodNotAvailable, never InvalidMethod
        assert!(!matches!(result, Err(ElevationError::InvalidMethod(_))));
    }
}
