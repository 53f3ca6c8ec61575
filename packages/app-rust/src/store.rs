//! Persisted configuration documents and their store.
//!
//! Two JSON files live in the config dir: `theme-check.json`, the resource
//! manifest a design export is validated and copied against, and
//! `extra-folder.json`, a list of path templates (with a `${theme}`
//! placeholder) created for each theme.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use themedesk_core::Service;
use tracing::{debug, info};

use crate::paths::AppPaths;

/// Placeholder substituted with the theme name in extra-folder and
/// manifest destination templates.
pub const THEME_PLACEHOLDER: &str = "${theme}";

/// On-disk name of the design-export folder inside a workspace. Existing
/// user workspaces already carry this name, so it is not translated.
pub const CUTOUT_DIR: &str = "切图";

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Resource manifest: maps a file name expected under the design-export
/// folder to its destination template in the project source tree. The
/// template may carry [`THEME_PLACEHOLDER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeManifest {
    pub necessary: BTreeMap<String, String>,
    pub optional: BTreeMap<String, String>,
}

impl Default for ThemeManifest {
    fn default() -> Self {
        let necessary = [
            ("logo.png", "${theme}/assets/images/logo.png"),
            ("banner.png", "${theme}/assets/images/banner.png"),
            ("favicon.ico", "${theme}/assets/images/favicon.ico"),
        ];
        let optional = [("watermark.png", "${theme}/assets/images/watermark.png")];
        Self {
            necessary: necessary
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            optional: optional
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

fn default_extra_folders() -> Vec<String> {
    vec![
        format!("{THEME_PLACEHOLDER}/assets/fonts"),
        format!("{THEME_PLACEHOLDER}/assets/images"),
    ]
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// Reads and writes the two config documents.
///
/// All I/O is sequential; callers wanting serialized access across
/// concurrent requests register their channels as exclusive.
pub struct ConfigStore {
    paths: AppPaths,
}

impl ConfigStore {
    #[must_use]
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    #[must_use]
    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Create the config and backup dirs and seed missing documents with
    /// defaults.
    ///
    /// # Errors
    ///
    /// Filesystem failures while creating dirs or seeding files.
    pub async fn ensure(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.paths.config_dir).await?;
        tokio::fs::create_dir_all(&self.paths.backup_dir).await?;

        let manifest_file = self.paths.manifest_file();
        if !manifest_file.exists() {
            info!(file = %manifest_file.display(), "seeding default theme manifest");
            write_json(&manifest_file, &ThemeManifest::default()).await?;
        }
        let extra_file = self.paths.extra_folders_file();
        if !extra_file.exists() {
            info!(file = %extra_file.display(), "seeding default extra folders");
            write_json(&extra_file, &default_extra_folders()).await?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Read or parse failures on `theme-check.json`.
    pub async fn load_manifest(&self) -> anyhow::Result<ThemeManifest> {
        read_json(&self.paths.manifest_file()).await
    }

    /// # Errors
    ///
    /// Write failures on `theme-check.json`.
    pub async fn save_manifest(&self, manifest: &ThemeManifest) -> anyhow::Result<()> {
        write_json(&self.paths.manifest_file(), manifest).await
    }

    /// # Errors
    ///
    /// Read or parse failures on `extra-folder.json`.
    pub async fn load_extra_folders(&self) -> anyhow::Result<Vec<String>> {
        read_json(&self.paths.extra_folders_file()).await
    }

    /// # Errors
    ///
    /// Write failures on `extra-folder.json`.
    pub async fn save_extra_folders(&self, folders: &[String]) -> anyhow::Result<()> {
        write_json(&self.paths.extra_folders_file(), &folders).await
    }

    /// Both documents as one JSON object.
    ///
    /// # Errors
    ///
    /// Read or parse failures on either document.
    pub async fn load_all(&self) -> anyhow::Result<Value> {
        Ok(json!({
            "manifest": self.load_manifest().await?,
            "extraFolders": self.load_extra_folders().await?,
        }))
    }

    /// Copy both documents into the backup dir under timestamped names.
    /// Returns the backup paths.
    ///
    /// # Errors
    ///
    /// Copy failures on either document.
    pub async fn backup(&self) -> anyhow::Result<Vec<PathBuf>> {
        let stamp = themedesk_core::time::epoch_ms();
        let mut backed_up = Vec::with_capacity(2);
        for source in [self.paths.manifest_file(), self.paths.extra_folders_file()] {
            let stem = source
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("config");
            let target = self.paths.backup_dir.join(format!("{stem}.{stamp}.json"));
            tokio::fs::copy(&source, &target).await?;
            debug!(from = %source.display(), to = %target.display(), "config backed up");
            backed_up.push(target);
        }
        Ok(backed_up)
    }

    /// Overwrite both documents with their defaults.
    ///
    /// # Errors
    ///
    /// Write failures on either document.
    pub async fn reset(&self) -> anyhow::Result<Value> {
        write_json(&self.paths.manifest_file(), &ThemeManifest::default()).await?;
        write_json(&self.paths.extra_folders_file(), &default_extra_folders()).await?;
        info!("configuration reset to defaults");
        self.load_all().await
    }
}

#[async_trait]
impl Service for ConfigStore {}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let raw = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ConfigStore {
        ConfigStore::new(AppPaths::rooted(dir))
    }

    #[tokio::test]
    async fn ensure_seeds_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.ensure().await.unwrap();

        let manifest = s.load_manifest().await.unwrap();
        assert_eq!(manifest, ThemeManifest::default());
        assert!(manifest.necessary.contains_key("logo.png"));

        // A second ensure must not clobber edits.
        let mut edited = manifest;
        edited
            .necessary
            .insert("custom".to_string(), "Custom folder".to_string());
        s.save_manifest(&edited).await.unwrap();
        s.ensure().await.unwrap();
        assert_eq!(s.load_manifest().await.unwrap(), edited);
    }

    #[tokio::test]
    async fn backup_writes_timestamped_copies() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.ensure().await.unwrap();

        let backed_up = s.backup().await.unwrap();
        assert_eq!(backed_up.len(), 2);
        for path in &backed_up {
            assert!(path.exists());
            assert!(path.starts_with(&s.paths().backup_dir));
        }
    }

    #[tokio::test]
    async fn reset_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.ensure().await.unwrap();
        s.save_extra_folders(&["${theme}/other".to_string()])
            .await
            .unwrap();

        s.reset().await.unwrap();
        assert_eq!(s.load_extra_folders().await.unwrap(), super::default_extra_folders());
    }

    #[tokio::test]
    async fn load_all_bundles_both_documents() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.ensure().await.unwrap();

        let all = s.load_all().await.unwrap();
        assert!(all["manifest"]["necessary"].is_object());
        assert!(all["extraFolders"].is_array());
    }
}
