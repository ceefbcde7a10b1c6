//! Privilege elevation for nft invocations
//!
//! Changing NAT tables needs `CAP_NET_ADMIN`. natfwd is normally run as root;
//! when it is not, only the `nft` binary is run through an elevation helper.
//!
//! # Elevation Strategy
//!
//! - **Root**: run `nft` directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `NATFWD_ELEVATION_METHOD`: Force `sudo`, `run0`, or `pkexec`.
//! - `NATFWD_NFT_COMMAND`: Path of the nft binary to run instead of `nft`.
//! - `NATFWD_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only the nft binary can be elevated
//! - Commands are constructed without shell interpolation
//! - Helper binaries are checked for availability before use

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit or run as root")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `NATFWD_ELEVATION_METHOD`
    #[error("Invalid NATFWD_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn nft_program() -> String {
    std::env::var("NATFWD_NFT_COMMAND")
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "nft".to_string())
}

fn wrapped(helper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Creates an `nft` command with the specified arguments, elevated if needed
///
/// Arguments are passed directly to `nft` without shell interpretation.
///
/// # Errors
///
/// Returns `Err` if the forced or detected elevation helper is unavailable.
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    let program = nft_program();

    // 1. Strict test mode override
    if std::env::var("NATFWD_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(&program, args));
    }

    // 2. Direct root execution
    if nix::unistd::getuid().is_root() {
        return Ok(direct(&program, args));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("NATFWD_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, &program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(wrapped("run0", &program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", &program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", &program, args))
    }
}
