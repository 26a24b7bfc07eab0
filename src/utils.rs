use std::path::{Path, PathBuf};

use anyhow::anyhow;
use directories::ProjectDirs;
use once_cell::sync::OnceCell;

/// Per-user data directory holding the cluster config and the job record.
pub fn data_dir() -> anyhow::Result<&'static Path> {
    static DATA_DIR: OnceCell<PathBuf> = OnceCell::new();
    DATA_DIR
        .get_or_try_init(|| {
            let dirs = ProjectDirs::from("org", "jobswarm", "jobswarm")
                .ok_or(anyhow!("Failed to get project dirs"))?;
            let path = dirs.data_dir();
            std::fs::create_dir_all(path)?;
            Ok(path.to_path_buf())
        })
        .map(PathBuf::as_path)
}

/// `--config` wins, then the per-user data directory.
pub fn config_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(data_dir()?.join("config")),
    }
}
