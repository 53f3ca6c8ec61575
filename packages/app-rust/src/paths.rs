//! Filesystem layout for persisted configuration.

use std::path::{Path, PathBuf};

/// Where the app keeps its config documents and their backups.
///
/// Debug builds write to a `dev_config` leaf so development never clobbers a
/// real installation's files.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl AppPaths {
    /// Resolve under the platform config dir, or an explicit override.
    #[must_use]
    pub fn resolve(override_dir: Option<PathBuf>) -> Self {
        let config_dir = override_dir.unwrap_or_else(|| {
            let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
            let leaf = if cfg!(debug_assertions) {
                "dev_config"
            } else {
                "config"
            };
            base.join("themedesk").join(leaf)
        });
        let backup_dir = config_dir.join("backups");
        Self {
            config_dir,
            backup_dir,
        }
    }

    /// Rooted at an explicit directory, as used by tests.
    #[must_use]
    pub fn rooted(dir: &Path) -> Self {
        Self::resolve(Some(dir.to_path_buf()))
    }

    #[must_use]
    pub fn manifest_file(&self) -> PathBuf {
        self.config_dir.join("theme-check.json")
    }

    #[must_use]
    pub fn extra_folders_file(&self) -> PathBuf {
        self.config_dir.join("extra-folder.json")
    }
}
