use std::path::PathBuf;

use anyhow::Result;

pub const DATA_DIR_ENV: &str = "VERBI_DATA_DIR";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(DATA_DIR_ENV) {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    let home_var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    match std::env::var_os(home_var) {
        Some(home) if !home.is_empty() => Ok(PathBuf::from(home).join(".verbi")),
        _ => Ok(std::env::current_dir()?.join(".verbi")),
    }
}

/// Scratch space for per-turn audio files.
pub fn scratch_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("tmp")
}

pub fn journal_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("history.sqlite3")
}
