//! Utility functions for directory management and file persistence
//!
//! Directories follow the XDG Base Directory specification:
//!
//! - Config: `~/.config/hostwall/` - Engine configuration (`config.json`)
//! - State: `~/.local/state/hostwall/` - Snapshots, apply lock, audit log
//!
//! When running as root these resolve under `/root`, which is what a host
//! firewall tool run through sudo expects.
//!
//! # Example
//!
//! ```
//! use hostwall::utils::{get_config_dir, get_state_dir};
//!
//! if let Some(state) = get_state_dir() {
//!     let snapshots = state.join("snapshots");
//!     # let _ = snapshots;
//! }
//! # let _ = get_config_dir();
//! ```

use directories::ProjectDirs;
use std::io::Write;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "hostwall", "hostwall")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Creates `dir` and its parents with mode 0700.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
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
    if let Some(dir) = get_config_dir() {
        ensure_dir(&dir)?;
    }
    if let Some(dir) = get_state_dir() {
        ensure_dir(&dir)?;
    }
    Ok(())
}

/// Writes `contents` to `path` atomically with mode 0600.
///
/// The data goes to a temporary file in the same directory, is synced, and is
/// then renamed over the target, so readers see either the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    // tempfile creates the file with mode 0600 on Unix
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}
