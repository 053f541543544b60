//! Central path resolution for Arbor's own data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `ARBOR_DATA_DIR` env > `~/.arbor`.
//! Repository locations are configuration, not data, and live in `GitConfig`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Resolve the data directory without installing it.
pub fn resolve_data_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Ok(env_val) = std::env::var("ARBOR_DATA_DIR") {
        if !env_val.trim().is_empty() {
            return Ok(PathBuf::from(env_val));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".arbor"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME directory not found"))
}

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    let dir = resolve_data_dir(explicit)?;
    let mut guard = DATA_DIR
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(dir.clone());
    Ok(dir)
}

/// Current data directory. Falls back to resolving defaults when
/// `init_data_dir` has not run, so library callers never panic.
pub fn data_dir() -> PathBuf {
    let installed = DATA_DIR
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    installed
        .or_else(|| resolve_data_dir(None).ok())
        .unwrap_or_else(|| PathBuf::from(".arbor"))
}

pub fn db_path() -> PathBuf {
    data_dir().join("arbor.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins_and_derives_file_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = init_data_dir(Some(dir.path())).expect("init");
        assert_eq!(resolved, dir.path());

        assert_eq!(db_path(), dir.path().join("arbor.db"));
        assert_eq!(log_dir(), dir.path().join("logs"));

        ensure_dirs().expect("ensure dirs");
        assert!(dir.path().join("logs").is_dir());
    }
}
